use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use thiserror::Error;

use crate::config::{DnsProviderConfig, DnsProviderKind};
use crate::core::error::ReconcileError;
use crate::domain::normalize_domain_for_storage;
use crate::issuance::dns::PropagationChecker;
use crate::issuance::http::{self, StatusClass};

mod cloudflare;
mod digitalocean;
mod memory;
mod route53;

pub use cloudflare::CloudflareProvider;
pub use digitalocean::DigitalOceanProvider;
pub use memory::MemoryDnsProvider;
pub use route53::Route53Provider;

pub type DnsResult<T> = Result<T, DnsProviderError>;

#[derive(Debug, Error)]
pub enum DnsProviderError {
    #[error("{provider} authentication failed")]
    Authentication { provider: &'static str },
    #[error("no {provider} zone found for '{domain}'")]
    ZoneNotFound {
        provider: &'static str,
        domain: String,
    },
    #[error("{provider} rate limit exceeded")]
    RateLimited {
        provider: &'static str,
        retry_after: Option<Duration>,
    },
    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },
    #[error("{provider} request failed: {message}")]
    Network {
        provider: &'static str,
        message: String,
    },
    #[error("invalid {provider} response: {message}")]
    InvalidResponse {
        provider: &'static str,
        message: String,
    },
    #[error("invalid DNS provider configuration: {0}")]
    Configuration(String),
}

impl From<DnsProviderError> for ReconcileError {
    fn from(err: DnsProviderError) -> Self {
        match err {
            DnsProviderError::RateLimited {
                provider,
                retry_after,
            } => ReconcileError::RateLimited {
                service: provider.to_string(),
                retry_after,
            },
            DnsProviderError::Network { .. } => ReconcileError::TransientNetwork(err.to_string()),
            DnsProviderError::Api { status, .. } if status >= 500 => {
                ReconcileError::TransientNetwork(err.to_string())
            }
            DnsProviderError::InvalidResponse { .. } => ReconcileError::Internal(err.to_string()),
            DnsProviderError::Authentication { .. }
            | DnsProviderError::ZoneNotFound { .. }
            | DnsProviderError::Api { .. }
            | DnsProviderError::Configuration(_) => {
                ReconcileError::Configuration(err.to_string())
            }
        }
    }
}

/// A TXT record as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    pub value: String,
}

/// Low-level record operations every provider implements.
///
/// `record_name` is always the fully qualified name without a trailing dot.
/// Idempotency (list before create, tolerate missing records on delete) is
/// layered on top by the challenge solver.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Creates one TXT record and returns its provider id.
    async fn create_record(&self, record_name: &str, value: &str) -> DnsResult<String>;

    /// Deletes one record. A record that no longer exists is not an error.
    async fn delete_record(&self, record: &DnsRecord) -> DnsResult<()>;

    /// Lists TXT records named `record_name`.
    async fn list_records(&self, record_name: &str) -> DnsResult<Vec<DnsRecord>>;

    /// Canonical form of a TXT value for comparison. Providers differ on quoting.
    fn normalize_value(&self, value: &str) -> String {
        value.trim().trim_matches('"').trim().to_string()
    }
}

pub(crate) fn matches_zone(domain_suffix: &str, zone_name: &str) -> bool {
    let domain_suffix = match normalize_domain_for_storage(domain_suffix) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let zone_name = match normalize_domain_for_storage(zone_name.trim_end_matches('.')) {
        Ok(value) => value,
        Err(_) => return false,
    };
    zone_name == domain_suffix || domain_suffix.ends_with(&format!(".{}", zone_name))
}

/// Maps a non-success provider response to an error, consuming the body for context.
pub(crate) async fn status_error(provider: &'static str, response: Response) -> DnsProviderError {
    let status = response.status();
    let retry_after = http::parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    status_error_from_parts(provider, status, retry_after, body)
}

fn status_error_from_parts(
    provider: &'static str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> DnsProviderError {
    match http::classify(status) {
        StatusClass::Unauthorized => DnsProviderError::Authentication { provider },
        StatusClass::RateLimited => DnsProviderError::RateLimited {
            provider,
            retry_after,
        },
        _ => DnsProviderError::Api {
            provider,
            status: status.as_u16(),
            message: if body.is_empty() {
                status.to_string()
            } else {
                body
            },
        },
    }
}

pub(crate) fn network_error(provider: &'static str, err: reqwest::Error) -> DnsProviderError {
    if err.is_decode() {
        return DnsProviderError::InvalidResponse {
            provider,
            message: err.to_string(),
        };
    }
    DnsProviderError::Network {
        provider,
        message: err.to_string(),
    }
}

/// A provider built from configuration. `checker` is set when the provider's
/// records are not observable through public DNS (the in-memory zone).
pub struct ConfiguredProvider {
    pub provider: Arc<dyn DnsProvider>,
    pub checker: Option<Arc<dyn PropagationChecker>>,
}

/// Builds the provider described by `config`, resolving its credentials.
pub async fn create_provider(config: &DnsProviderConfig) -> Result<ConfiguredProvider, ReconcileError> {
    if config.suffixes.is_empty() {
        return Err(DnsProviderError::Configuration(format!("{} has no suffixes", config.name)).into());
    }
    let provider: Arc<dyn DnsProvider> = match &config.provider {
        DnsProviderKind::Cloudflare { api_token } => {
            let token = api_token.resolve()?;
            Arc::new(CloudflareProvider::new(token.to_string()))
        }
        DnsProviderKind::DigitalOcean { api_token } => {
            let token = api_token.resolve()?;
            Arc::new(DigitalOceanProvider::new(
                token.to_string(),
                config.suffixes.clone(),
            ))
        }
        DnsProviderKind::Route53 {
            access_key_id,
            secret_access_key,
            region,
        } => {
            let keys = match (access_key_id, secret_access_key) {
                (Some(access), Some(secret)) => {
                    Some((access.resolve()?.to_string(), secret.resolve()?.to_string()))
                }
                (None, None) => None,
                _ => {
                    return Err(DnsProviderError::Configuration(format!(
                        "{}: route53 needs both access_key_id and secret_access_key",
                        config.name
                    ))
                    .into());
                }
            };
            Arc::new(Route53Provider::connect(keys, region.clone()).await)
        }
        DnsProviderKind::Memory => {
            let memory = Arc::new(MemoryDnsProvider::new(&config.name));
            return Ok(ConfiguredProvider {
                provider: memory.clone(),
                checker: Some(memory),
            });
        }
    };
    Ok(ConfiguredProvider {
        provider,
        checker: None,
    })
}
