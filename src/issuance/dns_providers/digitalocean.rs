use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    DnsProvider, DnsProviderError, DnsRecord, DnsResult, matches_zone, network_error, status_error,
};
use crate::issuance::http::HttpClient;

const PROVIDER: &str = "DigitalOcean";
const API_BASE: &str = "https://api.digitalocean.com/v2";

/// DigitalOcean domains API. Zones are the configured suffixes; the API
/// addresses records by name relative to the zone.
pub struct DigitalOceanProvider {
    api_token: String,
    base_url: String,
    domains: Vec<String>,
}

#[derive(Serialize)]
struct DigitalOceanDnsRecord {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: String,
    data: String,
    ttl: u32,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordResponse {
    domain_record: DigitalOceanDnsRecordItem,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordListResponse {
    domain_records: Vec<DigitalOceanDnsRecordItem>,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordItem {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    data: Option<String>,
}

impl DigitalOceanProvider {
    pub fn new(api_token: String, domains: Vec<String>) -> Self {
        Self {
            api_token,
            base_url: API_BASE.to_string(),
            domains,
        }
    }

    fn domain_for(&self, record_name: &str) -> DnsResult<&str> {
        self.domains
            .iter()
            .filter(|domain| matches_zone(record_name, domain))
            .max_by_key(|domain| domain.len())
            .map(String::as_str)
            .ok_or_else(|| DnsProviderError::ZoneNotFound {
                provider: PROVIDER,
                domain: record_name.to_string(),
            })
    }

    /// `_acme-challenge.example.com` in `example.com` becomes `_acme-challenge`.
    fn to_relative_name(record_name: &str, domain: &str) -> String {
        let record_name = record_name.trim_end_matches('.');
        let domain = domain.trim_end_matches('.');
        if record_name == domain {
            return "@".to_string();
        }
        record_name
            .strip_suffix(&format!(".{}", domain))
            .unwrap_or(record_name)
            .to_string()
    }

    fn to_absolute_name(relative: &str, domain: &str) -> String {
        if relative == "@" || relative.is_empty() {
            domain.to_string()
        } else {
            format!("{relative}.{domain}")
        }
    }

    /// DigitalOcean quotes TXT data itself.
    fn format_txt_content(value: &str) -> String {
        value.trim().trim_matches('"').trim().to_string()
    }
}

#[async_trait]
impl DnsProvider for DigitalOceanProvider {
    fn name(&self) -> &str {
        "digitalocean"
    }

    async fn create_record(&self, record_name: &str, value: &str) -> DnsResult<String> {
        let domain = self.domain_for(record_name)?;
        let record = DigitalOceanDnsRecord {
            record_type: "TXT",
            name: Self::to_relative_name(record_name, domain),
            data: Self::format_txt_content(value),
            ttl: 300,
        };
        let response = HttpClient::shared()
            .post(format!("{}/domains/{}/records", self.base_url, domain))
            .bearer_auth(&self.api_token)
            .json(&record)
            .send()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }
        let created: DigitalOceanDnsRecordResponse = response
            .json()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        Ok(created.domain_record.id.to_string())
    }

    async fn delete_record(&self, record: &DnsRecord) -> DnsResult<()> {
        let domain = self.domain_for(&record.name)?;
        let response = HttpClient::shared()
            .delete(format!(
                "{}/domains/{}/records/{}",
                self.base_url, domain, record.id
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
        let domain = self.domain_for(record_name)?;
        // The name filter takes the fully qualified name.
        let response = HttpClient::shared()
            .get(format!("{}/domains/{}/records", self.base_url, domain))
            .query(&[("type", "TXT"), ("name", record_name)])
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }
        let listed: DigitalOceanDnsRecordListResponse = response
            .json()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        Ok(listed
            .domain_records
            .into_iter()
            .map(|record| DnsRecord {
                id: record.id.to_string(),
                name: Self::to_absolute_name(&record.name, domain),
                value: record.data.unwrap_or_default(),
            })
            .filter(|record| record.name == record_name)
            .collect())
    }
}
