//! DNS-01 record naming and propagation checks.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::core::error::{ReconcileError, ReconcileResult};
use crate::domain::base_domain;
use crate::issuance::http::HttpClient;

pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// TXT record name for a domain; wildcard labels publish at the base domain.
pub fn record_name(domain: &str) -> String {
    let trimmed = base_domain(domain.trim_end_matches('.'));
    if trimmed.starts_with("_acme-challenge.") {
        trimmed.to_string()
    } else {
        format!("{ACME_CHALLENGE_LABEL}.{trimmed}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationState {
    Pending,
    Found,
    NxDomain,
    WrongContent,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsPropagationResult {
    pub state: PropagationState,
    pub reason: Option<String>,
    pub observed_values: Vec<String>,
}

/// What one resolver returned for a TXT query. `status` is the DNS RCODE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverAnswer {
    pub resolver: String,
    pub status: u32,
    pub values: Vec<String>,
}

/// Source of TXT observations for a record name.
#[async_trait]
pub trait PropagationChecker: Send + Sync {
    async fn query_txt(&self, record_name: &str) -> ReconcileResult<Vec<ResolverAnswer>>;
}

/// Queries several DNS-over-HTTPS JSON resolvers concurrently.
#[derive(Debug, Clone)]
pub struct DohPropagationChecker {
    resolvers: Vec<(String, String)>,
}

impl Default for DohPropagationChecker {
    fn default() -> Self {
        Self {
            resolvers: vec![
                (
                    "Google DNS".to_string(),
                    "https://dns.google/resolve".to_string(),
                ),
                (
                    "Cloudflare DNS".to_string(),
                    "https://cloudflare-dns.com/dns-query".to_string(),
                ),
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
struct DohAnswer {
    data: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

impl DohPropagationChecker {
    pub fn with_resolvers(resolvers: Vec<(String, String)>) -> Self {
        Self { resolvers }
    }

    async fn query_one(resolver: String, url: String, record_name: String) -> ReconcileResult<ResolverAnswer> {
        let response = HttpClient::shared()
            .get(&url)
            .query(&[("name", record_name.as_str()), ("type", "TXT")])
            .header("Accept", "application/dns-json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ReconcileError::TransientNetwork(format!(
                "{resolver} returned {}",
                response.status()
            )));
        }
        let parsed: DohResponse = response.json().await?;
        let values = parsed
            .answer
            .unwrap_or_default()
            .into_iter()
            .filter_map(|answer| answer.data)
            .map(|data| trim_txt_quotes(&data))
            .collect();
        Ok(ResolverAnswer {
            resolver,
            status: parsed.status,
            values,
        })
    }
}

#[async_trait]
impl PropagationChecker for DohPropagationChecker {
    async fn query_txt(&self, record_name: &str) -> ReconcileResult<Vec<ResolverAnswer>> {
        let mut tasks = JoinSet::new();
        for (resolver, url) in &self.resolvers {
            tasks.spawn(Self::query_one(
                resolver.clone(),
                url.clone(),
                record_name.to_string(),
            ));
        }

        let mut answers = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(answer)) => {
                    debug!(
                        "[dns] {} responded for {}: status={} values={:?}",
                        answer.resolver, record_name, answer.status, answer.values
                    );
                    answers.push(answer);
                }
                Ok(Err(err)) => debug!("[dns] resolver query failed for {}: {}", record_name, err),
                Err(err) => warn!("[dns] resolver task failed: {}", err),
            }
        }

        if answers.is_empty() {
            return Err(ReconcileError::TransientNetwork(format!(
                "dns query failed for {record_name} across resolvers"
            )));
        }
        Ok(answers)
    }
}

/// Queries the nameservers delegated for the record's zone, so a value is
/// only reported once the zone itself serves it.
pub struct AuthoritativePropagationChecker {
    recursive: TokioResolver,
}

impl AuthoritativePropagationChecker {
    pub fn new() -> Self {
        Self {
            recursive: build_resolver(ResolverConfig::default()),
        }
    }

    /// Nameserver hosts of the closest enclosing zone of `record_name`.
    async fn zone_nameservers(
        &self,
        record_name: &str,
    ) -> ReconcileResult<(String, Vec<String>)> {
        for zone in candidate_zones(record_name) {
            let Ok(lookup) = self.recursive.ns_lookup(zone.as_str()).await else {
                continue;
            };
            let hosts: Vec<String> = lookup.iter().map(|ns| ns.to_string()).collect();
            if !hosts.is_empty() {
                return Ok((zone, hosts));
            }
        }
        Err(ReconcileError::TransientNetwork(format!(
            "no delegated nameservers found for {record_name}"
        )))
    }

    async fn query_nameserver(
        &self,
        host: &str,
        record_name: &str,
    ) -> ReconcileResult<ResolverAnswer> {
        let addresses = self.recursive.lookup_ip(host).await.map_err(|err| {
            ReconcileError::TransientNetwork(format!("failed to resolve nameserver {host}: {err}"))
        })?;
        let mut config = ResolverConfig::new();
        for ip in addresses.iter() {
            config.add_name_server(NameServerConfig::new(SocketAddr::new(ip, 53), Protocol::Udp));
        }
        let resolver = build_resolver(config);

        let (status, values) = match resolver.txt_lookup(record_name).await {
            Ok(lookup) => {
                let values = lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|data| String::from_utf8_lossy(data))
                            .collect::<String>()
                    })
                    .collect();
                (0, values)
            }
            Err(err) => match empty_answer_status(&err.to_string()) {
                Some(status) => (status, Vec::new()),
                None => {
                    return Err(ReconcileError::TransientNetwork(format!(
                        "{host} failed TXT lookup for {record_name}: {err}"
                    )));
                }
            },
        };
        Ok(ResolverAnswer {
            resolver: host.trim_end_matches('.').to_string(),
            status,
            values,
        })
    }
}

impl Default for AuthoritativePropagationChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PropagationChecker for AuthoritativePropagationChecker {
    async fn query_txt(&self, record_name: &str) -> ReconcileResult<Vec<ResolverAnswer>> {
        let (zone, hosts) = self.zone_nameservers(record_name).await?;
        debug!("[dns] {} is served by {} via {:?}", record_name, zone, hosts);

        let mut answers = Vec::new();
        for host in &hosts {
            match self.query_nameserver(host, record_name).await {
                Ok(answer) => answers.push(answer),
                Err(err) => debug!("[dns] nameserver query failed for {}: {}", record_name, err),
            }
        }
        if answers.is_empty() {
            return Err(ReconcileError::TransientNetwork(format!(
                "no nameserver of {zone} answered for {record_name}"
            )));
        }
        Ok(answers)
    }
}

fn build_resolver(config: ResolverConfig) -> TokioResolver {
    let mut opts = ResolverOpts::default();
    opts.timeout = Duration::from_secs(5);
    opts.attempts = 2;
    // Every poll must reach the server.
    opts.cache_size = 0;
    Resolver::builder_with_config(config, TokioConnectionProvider::default())
        .with_options(opts)
        .build()
}

/// `record_name` and its parents, closest first, stopping above the TLD.
fn candidate_zones(record_name: &str) -> Vec<String> {
    let mut zones = Vec::new();
    let mut name = record_name.trim_end_matches('.');
    while name.contains('.') {
        zones.push(name.to_string());
        name = match name.split_once('.') {
            Some((_, parent)) => parent,
            None => break,
        };
    }
    zones
}

/// RCODE for lookup failures that just mean "nothing published yet".
fn empty_answer_status(message: &str) -> Option<u32> {
    let message = message.to_ascii_lowercase();
    if message.contains("nxdomain") {
        Some(3)
    } else if message.contains("no records found") || message.contains("record not found") {
        Some(0)
    } else {
        None
    }
}

pub(crate) fn trim_txt_quotes(value: &str) -> String {
    value.trim().trim_matches('"').trim().to_string()
}

pub fn interpret_dns_results(answers: &[ResolverAnswer], expected: &str) -> DnsPropagationResult {
    let mut observed = Vec::new();
    let mut saw_nxdomain = false;
    let mut saw_ok = false;

    for answer in answers {
        observed.extend(answer.values.iter().map(|value| trim_txt_quotes(value)));
        match answer.status {
            0 => saw_ok = true,
            3 => saw_nxdomain = true,
            other => warn!("[dns] unexpected status {} from {}", other, answer.resolver),
        }
    }

    let state = if observed.iter().any(|value| value == expected) {
        PropagationState::Found
    } else if !observed.is_empty() {
        PropagationState::WrongContent
    } else if saw_ok {
        PropagationState::Pending
    } else if saw_nxdomain {
        PropagationState::NxDomain
    } else {
        PropagationState::Error
    };
    let reason = match state {
        PropagationState::Found => None,
        PropagationState::WrongContent => Some("TXT record present with different value"),
        PropagationState::Pending => Some("record not found yet"),
        PropagationState::NxDomain => Some("record not found (NXDOMAIN)"),
        PropagationState::Error => Some("no responses from DNS resolvers"),
    };
    DnsPropagationResult {
        state,
        reason: reason.map(str::to_string),
        observed_values: observed,
    }
}

/// Polls until `expected` is observable at `record_name` or `timeout` elapses.
///
/// Other values at the same name keep the poll going: a sibling challenge
/// (apex plus wildcard) publishes at the same name.
pub async fn wait_for_propagation(
    checker: &dyn PropagationChecker,
    record_name: &str,
    expected: &str,
    timeout: Duration,
    interval: Duration,
) -> ReconcileResult<DnsPropagationResult> {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match checker.query_txt(record_name).await {
            Ok(answers) => {
                let result = interpret_dns_results(&answers, expected);
                if result.state == PropagationState::Found {
                    info!(
                        "[dns] {} visible after {}ms (attempt {})",
                        record_name,
                        started.elapsed().as_millis(),
                        attempt
                    );
                    return Ok(result);
                }
                debug!(
                    "[dns] {} not visible yet (state={:?}, observed={:?})",
                    record_name, result.state, result.observed_values
                );
            }
            Err(err) => debug!("[dns] propagation check attempt {} failed: {}", attempt, err),
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            warn!(
                "[dns] propagation timeout for {} after {}ms ({} attempts)",
                record_name,
                elapsed.as_millis(),
                attempt
            );
            return Err(ReconcileError::ChallengePropagationTimeout {
                record: record_name.to_string(),
                elapsed,
            });
        }
        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}
