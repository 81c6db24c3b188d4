use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::{
    DnsProvider, DnsProviderError, DnsRecord, DnsResult, matches_zone, network_error, status_error,
};
use crate::issuance::http::HttpClient;

const PROVIDER: &str = "Cloudflare";
const API_BASE: &str = "https://api.cloudflare.com/client/v4";
/// "An identical record already exists."
const IDENTICAL_RECORD_EXISTS: u32 = 81058;

pub struct CloudflareProvider {
    api_token: String,
    base_url: String,
    zones: OnceCell<Vec<CloudflareZone>>,
}

#[derive(Debug, Clone, Deserialize)]
struct CloudflareZone {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct CloudflareZoneListResponse {
    result: Vec<CloudflareZone>,
    success: bool,
}

#[derive(Serialize)]
struct CloudflareDnsRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: &'a str,
    content: String,
    ttl: u32,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordResponse {
    result: Option<CloudflareDnsRecordResult>,
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareError>,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordListResponse {
    result: Vec<CloudflareDnsRecordResult>,
    success: bool,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordResult {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CloudflareError {
    code: u32,
    message: String,
}

impl CloudflareProvider {
    pub fn new(api_token: String) -> Self {
        Self::with_base_url(api_token, API_BASE.to_string())
    }

    pub fn with_base_url(api_token: String, base_url: String) -> Self {
        Self {
            api_token,
            base_url: base_url.trim_end_matches('/').to_string(),
            zones: OnceCell::new(),
        }
    }

    fn format_txt_content(value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.starts_with('"') && trimmed.ends_with('"') {
            trimmed.to_string()
        } else {
            format!("\"{}\"", trimmed.trim_matches('"'))
        }
    }

    fn error_summary(errors: &[CloudflareError]) -> String {
        if errors.is_empty() {
            return "unknown error".to_string();
        }
        errors
            .iter()
            .map(|err| format!("{}: {}", err.code, err.message))
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn load_zones(&self) -> DnsResult<Vec<CloudflareZone>> {
        let response = HttpClient::shared()
            .get(format!("{}/zones?per_page=100", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }
        let zone_list: CloudflareZoneListResponse = response
            .json()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        if !zone_list.success {
            return Err(DnsProviderError::InvalidResponse {
                provider: PROVIDER,
                message: "zone listing returned unsuccessful response".to_string(),
            });
        }
        debug!("[cloudflare] discovered {} zone(s)", zone_list.result.len());
        Ok(zone_list.result)
    }

    /// Zone id for the most specific zone containing `record_name`.
    async fn zone_id_for(&self, record_name: &str) -> DnsResult<String> {
        let zones = self.zones.get_or_try_init(|| self.load_zones()).await?;
        select_zone(zones, record_name)
            .map(|zone| zone.id.clone())
            .ok_or_else(|| DnsProviderError::ZoneNotFound {
                provider: PROVIDER,
                domain: record_name.to_string(),
            })
    }

    async fn find_identical(&self, record_name: &str, value: &str) -> DnsResult<Option<String>> {
        let wanted = self.normalize_value(value);
        let existing = self.list_records(record_name).await?;
        Ok(existing
            .into_iter()
            .find(|record| self.normalize_value(&record.value) == wanted)
            .map(|record| record.id))
    }
}

fn select_zone<'a>(zones: &'a [CloudflareZone], record_name: &str) -> Option<&'a CloudflareZone> {
    zones
        .iter()
        .filter(|zone| matches_zone(record_name, &zone.name))
        .max_by_key(|zone| zone.name.len())
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    fn name(&self) -> &str {
        "cloudflare"
    }

    async fn create_record(&self, record_name: &str, value: &str) -> DnsResult<String> {
        let zone_id = self.zone_id_for(record_name).await?;
        let record = CloudflareDnsRecord {
            record_type: "TXT",
            name: record_name,
            content: Self::format_txt_content(value),
            ttl: 120,
        };
        let response = HttpClient::shared()
            .post(format!("{}/zones/{}/dns_records", self.base_url, zone_id))
            .bearer_auth(&self.api_token)
            .json(&record)
            .send()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;

        let status = response.status();
        if status.is_success() {
            let result: CloudflareDnsRecordResponse = response
                .json()
                .await
                .map_err(|err| network_error(PROVIDER, err))?;
            if result.success {
                if let Some(created) = result.result {
                    return Ok(created.id);
                }
            }
            return Err(DnsProviderError::InvalidResponse {
                provider: PROVIDER,
                message: Self::error_summary(&result.errors),
            });
        }

        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            let duplicate = serde_json::from_str::<CloudflareDnsRecordResponse>(&body)
                .map(|parsed| {
                    parsed
                        .errors
                        .iter()
                        .any(|err| err.code == IDENTICAL_RECORD_EXISTS)
                })
                .unwrap_or(false);
            if duplicate {
                if let Some(id) = self.find_identical(record_name, value).await? {
                    debug!("[cloudflare] reusing identical record {} for {}", id, record_name);
                    return Ok(id);
                }
            }
            return Err(DnsProviderError::Api {
                provider: PROVIDER,
                status: status.as_u16(),
                message: body,
            });
        }
        Err(status_error(PROVIDER, response).await)
    }

    async fn delete_record(&self, record: &DnsRecord) -> DnsResult<()> {
        let zone_id = self.zone_id_for(&record.name).await?;
        let response = HttpClient::shared()
            .delete(format!(
                "{}/zones/{}/dns_records/{}",
                self.base_url, zone_id, record.id
            ))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        if response.status().is_success() || response.status().as_u16() == 404 {
            return Ok(());
        }
        Err(status_error(PROVIDER, response).await)
    }

    async fn list_records(&self, record_name: &str) -> DnsResult<Vec<DnsRecord>> {
        let zone_id = self.zone_id_for(record_name).await?;
        let response = HttpClient::shared()
            .get(format!("{}/zones/{}/dns_records", self.base_url, zone_id))
            .query(&[("type", "TXT"), ("name", record_name)])
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }
        let listed: CloudflareDnsRecordListResponse = response
            .json()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        if !listed.success {
            return Err(DnsProviderError::InvalidResponse {
                provider: PROVIDER,
                message: "record listing returned unsuccessful response".to_string(),
            });
        }
        Ok(listed
            .result
            .into_iter()
            .map(|record| DnsRecord {
                id: record.id,
                name: if record.name.is_empty() {
                    record_name.to_string()
                } else {
                    record.name
                },
                value: record.content.unwrap_or_default(),
            })
            .collect())
    }
}
