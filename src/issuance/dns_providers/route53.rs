use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_route53::Client;
use aws_sdk_route53::config::Credentials;
use aws_sdk_route53::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use log::debug;
use tokio::sync::OnceCell;

use super::{DnsProvider, DnsProviderError, DnsRecord, DnsResult, matches_zone};

const PROVIDER: &str = "Route 53";
const TTL: i64 = 300;

/// Route 53 keeps every TXT value for a name in one record set, so records
/// are addressed by their quoted value and changes rewrite the whole set.
pub struct Route53Provider {
    client: Client,
    zones: OnceCell<Vec<(String, String)>>,
}

impl Route53Provider {
    /// Builds a client from explicit keys, or the default AWS credential chain.
    pub async fn connect(keys: Option<(String, String)>, region: Option<String>) -> Self {
        let region = RegionProviderChain::first_try(region.map(Region::new))
            .or_default_provider()
            .or_else(Region::new("us-east-1"));
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
        if let Some((access_key, secret_key)) = keys {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "cert-reconciler",
            ));
        }
        let config = loader.load().await;
        Self {
            client: Client::new(&config),
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

    async fn load_zones(&self) -> DnsResult<Vec<(String, String)>> {
        let mut zones = Vec::new();
        let mut paginator = self
            .client
            .list_hosted_zones()
            .into_paginator()
            .page_size(100)
            .send();
        while let Some(page) = paginator.next().await {
            let page = page.map_err(sdk_error)?;
            for zone in page.hosted_zones() {
                zones.push((
                    zone.id().to_string(),
                    zone.name().trim_end_matches('.').to_string(),
                ));
            }
        }
        debug!("[route53] discovered {} hosted zone(s)", zones.len());
        Ok(zones)
    }

    async fn zone_id_for(&self, record_name: &str) -> DnsResult<String> {
        let zones = self.zones.get_or_try_init(|| self.load_zones()).await?;
        zones
            .iter()
            .filter(|(_, name)| matches_zone(record_name, name))
            .max_by_key(|(_, name)| name.len())
            .map(|(id, _)| id.clone())
            .ok_or_else(|| DnsProviderError::ZoneNotFound {
                provider: PROVIDER,
                domain: record_name.to_string(),
            })
    }

    async fn current_values(&self, zone_id: &str, record_name: &str) -> DnsResult<Vec<String>> {
        let output = self
            .client
            .list_resource_record_sets()
            .hosted_zone_id(zone_id)
            .start_record_name(record_name)
            .start_record_type(RrType::Txt)
            .max_items(1)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(output
            .resource_record_sets()
            .iter()
            .find(|set| {
                set.name().trim_end_matches('.') == record_name && set.r#type() == &RrType::Txt
            })
            .map(|set| {
                set.resource_records()
                    .iter()
                    .map(|record| record.value().to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply(
        &self,
        zone_id: &str,
        record_name: &str,
        action: ChangeAction,
        values: &[String],
    ) -> DnsResult<()> {
        let records = values
            .iter()
            .map(|value| ResourceRecord::builder().value(value.clone()).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| DnsProviderError::Configuration(err.to_string()))?;
        let record_set = ResourceRecordSet::builder()
            .name(record_name)
            .set_type(Some(RrType::Txt))
            .ttl(TTL)
            .set_resource_records(Some(records))
            .build()
            .map_err(|err| DnsProviderError::Configuration(err.to_string()))?;
        let change = Change::builder()
            .action(action)
            .resource_record_set(record_set)
            .build()
            .map_err(|err| DnsProviderError::Configuration(err.to_string()))?;
        let batch = ChangeBatch::builder()
            .changes(change)
            .build()
            .map_err(|err| DnsProviderError::Configuration(err.to_string()))?;
        self.client
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}

fn sdk_error<E, R>(err: SdkError<E, R>) -> DnsProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some("Throttling") | Some("ThrottlingException") | Some("PriorRequestNotComplete") => {
            DnsProviderError::RateLimited {
                provider: PROVIDER,
                retry_after: None,
            }
        }
        Some("AccessDenied") | Some("InvalidClientTokenId") | Some("SignatureDoesNotMatch") => {
            DnsProviderError::Authentication { provider: PROVIDER }
        }
        Some(code) => DnsProviderError::Api {
            provider: PROVIDER,
            status: 400,
            message: format!("{code}: {}", err.message().unwrap_or_default()),
        },
        None => DnsProviderError::Network {
            provider: PROVIDER,
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

#[async_trait]
impl DnsProvider for Route53Provider {
    fn name(&self) -> &str {
        "route53"
    }

    async fn create_record(&self, record_name: &str, value: &str) -> DnsResult<String> {
        let zone_id = self.zone_id_for(record_name).await?;
        let formatted = Self::format_txt_content(value);
        let mut values = self.current_values(&zone_id, record_name).await?;
        if !values.contains(&formatted) {
            values.push(formatted.clone());
            self.apply(&zone_id, record_name, ChangeAction::Upsert, &values)
                .await?;
        }
        Ok(formatted)
    }

    async fn delete_record(&self, record: &DnsRecord) -> DnsResult<()> {
        let zone_id = self.zone_id_for(&record.name).await?;
        let values = self.current_values(&zone_id, &record.name).await?;
        if !values.contains(&record.id) {
            return Ok(());
        }
        let remaining: Vec<String> = values.iter().filter(|v| **v != record.id).cloned().collect();
        if remaining.is_empty() {
            // DELETE must name the exact current set.
            self.apply(&zone_id, &record.name, ChangeAction::Delete, &values)
                .await
        } else {
            self.apply(&zone_id, &record.name, ChangeAction::Upsert, &remaining)
                .await
        }
    }

    async fn list_records(&self, record_name: &str) -> DnsResult<Vec<DnsRecord>> {
        let zone_id = self.zone_id_for(record_name).await?;
        let values = self.current_values(&zone_id, record_name).await?;
        Ok(values
            .into_iter()
            .map(|value| DnsRecord {
                id: value.clone(),
                name: record_name.to_string(),
                value,
            })
            .collect())
    }
}
