//! Daemon configuration, loaded from a JSON file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use crate::core::types::CertificateRequest;
use crate::domain::{matches_suffix, normalize_domain_set, normalize_domain_suffix_for_storage};
use crate::issuance::machine::IssuanceTimeouts;
use crate::issuance::retry::RetryPolicy;
use crate::reconciler::scheduler::RenewalThreshold;
use crate::secrets::credentials::SecretSource;
use crate::secrets::store::validate_secret_name;

pub const CONFIG_ENV: &str = "CERT_RECONCILER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub issuers: Vec<IssuerConfig>,
    #[serde(default)]
    pub dns_providers: Vec<DnsProviderConfig>,
    #[serde(default)]
    pub secret_store: SecretStoreConfig,
    #[serde(default)]
    pub status_db: Option<PathBuf>,
    #[serde(default)]
    pub requests: Vec<CertificateRequest>,
    #[serde(default)]
    pub renewal: RenewalConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub propagation_check: PropagationCheck,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuerConfig {
    pub name: String,
    #[serde(flatten)]
    pub authority: AuthorityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthorityConfig {
    Acme {
        directory_url: String,
        #[serde(default)]
        contact_email: Option<String>,
        /// PEM-encoded P-256 account key. Generated per process when absent.
        #[serde(default)]
        account_key: Option<SecretSource>,
        #[serde(default)]
        tos_agreed: bool,
    },
    LocalCa {
        #[serde(default)]
        ca_cert: Option<SecretSource>,
        #[serde(default)]
        ca_key: Option<SecretSource>,
        #[serde(default = "default_lifetime_days")]
        certificate_lifetime_days: u32,
    },
}

fn default_lifetime_days() -> u32 {
    90
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsProviderConfig {
    pub name: String,
    /// Domain suffixes (zones) this provider is authoritative for.
    pub suffixes: Vec<String>,
    #[serde(flatten)]
    pub provider: DnsProviderKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DnsProviderKind {
    Cloudflare {
        api_token: SecretSource,
    },
    #[serde(rename = "digitalocean")]
    DigitalOcean {
        api_token: SecretSource,
    },
    Route53 {
        /// Falls back to the default AWS credential chain when unset.
        #[serde(default)]
        access_key_id: Option<SecretSource>,
        #[serde(default)]
        secret_access_key: Option<SecretSource>,
        #[serde(default)]
        region: Option<String>,
    },
    Memory,
}

impl DnsProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsProviderKind::Cloudflare { .. } => "cloudflare",
            DnsProviderKind::DigitalOcean { .. } => "digitalocean",
            DnsProviderKind::Route53 { .. } => "route53",
            DnsProviderKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretStoreConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
    Kubernetes {
        #[serde(default)]
        namespace: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    pub threshold_fraction: Option<f64>,
    pub threshold_secs: Option<u64>,
    pub check_interval_secs: u64,
    pub failure_backoff_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            threshold_fraction: None,
            threshold_secs: None,
            check_interval_secs: 3600,
            failure_backoff_secs: 6 * 3600,
        }
    }
}

impl RenewalConfig {
    pub fn threshold(&self) -> RenewalThreshold {
        match (self.threshold_secs, self.threshold_fraction) {
            (Some(secs), _) => RenewalThreshold::Fixed(Duration::from_secs(secs)),
            (None, Some(fraction)) => RenewalThreshold::Fraction(fraction),
            (None, None) => RenewalThreshold::default(),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_secs)
    }
}

/// Where challenge records are looked for before the authority is told.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationCheck {
    /// The nameservers delegated for the record's zone.
    #[default]
    Authoritative,
    /// Public DNS-over-HTTPS resolvers.
    PublicResolvers,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub propagation_secs: u64,
    pub propagation_interval_secs: u64,
    pub authority_poll_secs: u64,
    pub authority_poll_interval_secs: u64,
    pub order_deadline_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            propagation_secs: 300,
            propagation_interval_secs: 10,
            authority_poll_secs: 300,
            authority_poll_interval_secs: 5,
            order_deadline_secs: 1800,
        }
    }
}

impl TimeoutConfig {
    pub fn to_timeouts(&self) -> IssuanceTimeouts {
        IssuanceTimeouts {
            propagation: Duration::from_secs(self.propagation_secs),
            propagation_interval: Duration::from_secs(self.propagation_interval_secs),
            authority_poll: Duration::from_secs(self.authority_poll_secs),
            authority_poll_interval: Duration::from_secs(self.authority_poll_interval_secs),
            order_deadline: Duration::from_secs(self.order_deadline_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_order_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_order_retries: 3,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryPolicy::default()
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Checks cross references and normalizes request domains and provider suffixes in place.
    pub fn validate(&mut self) -> Result<()> {
        let mut issuer_names = HashSet::new();
        for issuer in &self.issuers {
            if issuer.name.trim().is_empty() {
                bail!("issuer name must not be empty");
            }
            if !issuer_names.insert(issuer.name.clone()) {
                bail!("duplicate issuer '{}'", issuer.name);
            }
            match &issuer.authority {
                AuthorityConfig::Acme { directory_url, .. } => {
                    if !directory_url.starts_with("https://") && !directory_url.starts_with("http://") {
                        bail!("issuer '{}' has an invalid directory_url", issuer.name);
                    }
                }
                AuthorityConfig::LocalCa {
                    ca_cert,
                    ca_key,
                    certificate_lifetime_days,
                } => {
                    if ca_cert.is_some() != ca_key.is_some() {
                        bail!("issuer '{}' must set both ca_cert and ca_key", issuer.name);
                    }
                    if *certificate_lifetime_days == 0 {
                        bail!("issuer '{}' certificate_lifetime_days must be positive", issuer.name);
                    }
                }
            }
        }

        let mut provider_names = HashSet::new();
        for provider in &mut self.dns_providers {
            if !provider_names.insert(provider.name.clone()) {
                bail!("duplicate dns provider '{}'", provider.name);
            }
            let mut suffixes = Vec::new();
            for suffix in &provider.suffixes {
                let normalized = normalize_domain_suffix_for_storage(suffix)
                    .with_context(|| format!("dns provider '{}'", provider.name))?;
                if normalized.is_empty() {
                    bail!("dns provider '{}' has an empty suffix", provider.name);
                }
                suffixes.push(normalized);
            }
            if suffixes.is_empty() {
                bail!("dns provider '{}' needs at least one suffix", provider.name);
            }
            provider.suffixes = suffixes;
        }

        let mut request_names = HashSet::new();
        for request in &mut self.requests {
            if !request_names.insert(request.name.clone()) {
                bail!("duplicate request '{}'", request.name);
            }
            if !issuer_names.contains(&request.issuer) {
                bail!(
                    "request '{}' references unknown issuer '{}'",
                    request.name,
                    request.issuer
                );
            }
            validate_secret_name(&request.secret_name)
                .with_context(|| format!("request '{}'", request.name))?;
            request.domains = normalize_domain_set(&request.domains)
                .with_context(|| format!("request '{}'", request.name))?;
            for domain in &request.domains {
                let covered = self
                    .dns_providers
                    .iter()
                    .flat_map(|provider| provider.suffixes.iter())
                    .any(|suffix| matches_suffix(domain, suffix));
                if !covered {
                    return Err(anyhow!(
                        "request '{}': no dns provider covers domain '{}'",
                        request.name,
                        domain
                    ));
                }
            }
        }

        if let Some(fraction) = self.renewal.threshold_fraction {
            if self.renewal.threshold_secs.is_some() {
                bail!("renewal: set only one of threshold_fraction and threshold_secs");
            }
            if !(fraction > 0.0 && fraction < 1.0) {
                bail!("renewal.threshold_fraction must be between 0 and 1");
            }
        }
        if self.renewal.check_interval_secs == 0 {
            bail!("renewal.check_interval_secs must be positive");
        }
        if self.timeouts.propagation_interval_secs == 0
            || self.timeouts.authority_poll_interval_secs == 0
        {
            bail!("poll intervals must be positive");
        }
        Ok(())
    }

    pub fn issuer(&self, name: &str) -> Option<&IssuerConfig> {
        self.issuers.iter().find(|issuer| issuer.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "issuers": [
            {"name": "staging", "kind": "acme",
             "directory_url": "https://acme-staging-v02.api.letsencrypt.org/directory",
             "contact_email": "ops@example.com", "tos_agreed": true},
            {"name": "internal", "kind": "local_ca", "certificate_lifetime_days": 30}
        ],
        "dns_providers": [
            {"name": "cf", "kind": "cloudflare", "suffixes": ["Example.com."],
             "api_token": {"env": "CF_API_TOKEN"}},
            {"name": "aws", "kind": "route53", "suffixes": ["example.org"]}
        ],
        "secret_store": {"kind": "file", "path": "/var/lib/certs"},
        "requests": [
            {"name": "web", "domains": ["B.example.com", "a.example.com", "a.example.com"],
             "issuer": "staging", "secret_name": "web-tls"}
        ],
        "renewal": {"threshold_secs": 2592000},
        "retry": {"max_order_retries": 2}
    }"#;

    fn parse(raw: &str) -> Result<Config> {
        let mut config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn parses_and_normalizes_sample() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.issuers.len(), 2);
        assert_eq!(config.dns_providers[0].suffixes, vec!["example.com"]);
        assert_eq!(config.requests[0].domains, vec!["a.example.com", "b.example.com"]);
        assert!(matches!(config.secret_store, SecretStoreConfig::File { .. }));
        assert_eq!(
            config.renewal.threshold(),
            RenewalThreshold::Fixed(Duration::from_secs(2_592_000))
        );
        assert_eq!(config.retry.max_order_retries, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.timeouts.propagation_secs, 300);
        assert_eq!(config.propagation_check, PropagationCheck::Authoritative);
    }

    #[test]
    fn public_resolvers_can_replace_nameserver_checks() {
        let raw = SAMPLE.replace(
            r#""retry": {"max_order_retries": 2}"#,
            r#""retry": {"max_order_retries": 2}, "propagation_check": "public_resolvers""#,
        );
        let config = parse(&raw).unwrap();
        assert_eq!(config.propagation_check, PropagationCheck::PublicResolvers);
    }

    #[test]
    fn default_threshold_is_one_third() {
        assert_eq!(
            RenewalConfig::default().threshold(),
            RenewalThreshold::Fraction(1.0 / 3.0)
        );
    }

    #[test]
    fn rejects_unknown_issuer_reference() {
        let raw = SAMPLE.replace(r#""issuer": "staging""#, r#""issuer": "prod""#);
        let err = parse(&raw).unwrap_err();
        assert!(err.to_string().contains("unknown issuer"));
    }

    #[test]
    fn rejects_domain_without_provider() {
        let raw = SAMPLE.replace("a.example.com\", \"a.example.com", "a.example.net");
        let err = parse(&raw).unwrap_err();
        assert!(err.to_string().contains("no dns provider covers"));
    }

    #[test]
    fn rejects_secret_names_the_stores_refuse() {
        let raw = SAMPLE.replace(r#""secret_name": "web-tls""#, r#""secret_name": "Web_TLS""#);
        let err = parse(&raw).unwrap_err();
        assert!(format!("{err:#}").contains("Web_TLS"));
    }

    #[test]
    fn rejects_both_thresholds() {
        let raw = SAMPLE.replace(
            r#""threshold_secs": 2592000"#,
            r#""threshold_secs": 2592000, "threshold_fraction": 0.5"#,
        );
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn rejects_empty_domain_set() {
        let raw = SAMPLE.replace(
            r#"["B.example.com", "a.example.com", "a.example.com"]"#,
            "[]",
        );
        assert!(parse(&raw).is_err());
    }
}
