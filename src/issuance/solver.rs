//! DNS-01 challenge solver: publishes and removes `_acme-challenge` TXT
//! records through the provider responsible for each domain.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::core::error::{ReconcileError, ReconcileResult};
use crate::core::types::ChallengeHandle;
use crate::domain::{matches_suffix, normalize_domain_suffix_for_storage};
use crate::issuance::dns::{self, DnsPropagationResult, PropagationChecker, PropagationState};
use crate::issuance::dns_providers::{DnsProvider, DnsRecord};
use crate::issuance::retry::{RetryPolicy, retry_with_backoff};

struct SolverRoute {
    name: String,
    suffixes: Vec<String>,
    provider: Arc<dyn DnsProvider>,
    checker: Arc<dyn PropagationChecker>,
}

pub struct ChallengeSolver {
    routes: Vec<SolverRoute>,
    retry: RetryPolicy,
}

impl ChallengeSolver {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            routes: Vec::new(),
            retry,
        }
    }

    /// Registers `provider` for `suffixes`. `checker` observes its records publicly.
    pub fn register(
        &mut self,
        name: &str,
        suffixes: &[String],
        provider: Arc<dyn DnsProvider>,
        checker: Arc<dyn PropagationChecker>,
    ) {
        let suffixes = suffixes
            .iter()
            .filter_map(|suffix| normalize_domain_suffix_for_storage(suffix).ok())
            .filter(|suffix| !suffix.is_empty())
            .collect();
        self.routes.push(SolverRoute {
            name: name.to_string(),
            suffixes,
            provider,
            checker,
        });
    }

    pub fn covers(&self, domain: &str) -> bool {
        self.route_for(domain).is_ok()
    }

    /// Longest configured suffix wins.
    fn route_for(&self, domain: &str) -> ReconcileResult<&SolverRoute> {
        self.routes
            .iter()
            .filter_map(|route| {
                route
                    .suffixes
                    .iter()
                    .filter(|suffix| matches_suffix(domain, suffix))
                    .map(String::len)
                    .max()
                    .map(|len| (len, route))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, route)| route)
            .ok_or_else(|| {
                ReconcileError::Configuration(format!("no DNS provider configured for '{domain}'"))
            })
    }

    fn route_named(&self, name: &str) -> ReconcileResult<&SolverRoute> {
        self.routes
            .iter()
            .find(|route| route.name == name)
            .ok_or_else(|| ReconcileError::Configuration(format!("unknown DNS provider '{name}'")))
    }

    /// Publishes `value` at `_acme-challenge.<domain>`.
    ///
    /// An existing record with the same value is reused, so presenting twice
    /// leaves a single record.
    pub async fn present(&self, domain: &str, value: &str) -> ReconcileResult<ChallengeHandle> {
        let route = self.route_for(domain)?;
        let provider = route.provider.as_ref();
        let record_name = dns::record_name(domain);
        let wanted = provider.normalize_value(value);

        let name = record_name.as_str();
        let existing = retry_with_backoff(&self.retry, "list TXT records", || async move {
            provider
                .list_records(name)
                .await
                .map_err(ReconcileError::from)
        })
        .await?;

        let record_id = match existing
            .into_iter()
            .find(|record| provider.normalize_value(&record.value) == wanted)
        {
            Some(record) => {
                debug!(
                    "[solver] {} already carries the challenge value (record {})",
                    record_name, record.id
                );
                record.id
            }
            None => {
                retry_with_backoff(&self.retry, "create TXT record", || async move {
                    provider
                        .create_record(name, value)
                        .await
                        .map_err(ReconcileError::from)
                })
                .await?
            }
        };

        info!(
            "[solver] presented {} via {} (record {})",
            record_name, route.name, record_id
        );
        Ok(ChallengeHandle {
            provider: route.name.clone(),
            domain: domain.to_string(),
            record_name,
            value: value.to_string(),
            record_id,
        })
    }

    /// Removes the record behind `handle`. Removing an absent record succeeds.
    pub async fn cleanup(&self, handle: &ChallengeHandle) -> ReconcileResult<()> {
        let route = self.route_named(&handle.provider)?;
        let provider = route.provider.as_ref();
        let record = &DnsRecord {
            id: handle.record_id.clone(),
            name: handle.record_name.clone(),
            value: handle.value.clone(),
        };
        retry_with_backoff(&self.retry, "delete TXT record", || async move {
            provider
                .delete_record(record)
                .await
                .map_err(ReconcileError::from)
        })
        .await?;
        debug!("[solver] removed {} (record {})", handle.record_name, handle.record_id);
        Ok(())
    }

    /// Best-effort removal of every handle; failures are logged, never returned.
    pub async fn cleanup_all(&self, handles: &[ChallengeHandle]) {
        for handle in handles {
            if let Err(err) = self.cleanup(handle).await {
                warn!(
                    "[solver] failed to remove {} (record {}): {}",
                    handle.record_name, handle.record_id, err
                );
            }
        }
    }

    /// Removes every record carrying `value` at `domain`'s challenge name.
    /// Used when a create was interrupted before its record id came back.
    pub async fn withdraw(&self, domain: &str, value: &str) {
        let route = match self.route_for(domain) {
            Ok(route) => route,
            Err(err) => {
                warn!("[solver] cannot withdraw challenge for {}: {}", domain, err);
                return;
            }
        };
        let provider = route.provider.as_ref();
        let record_name = dns::record_name(domain);
        let name = record_name.as_str();
        let wanted = provider.normalize_value(value);
        let listed = retry_with_backoff(&self.retry, "list TXT records", || async move {
            provider
                .list_records(name)
                .await
                .map_err(ReconcileError::from)
        })
        .await;
        let records = match listed {
            Ok(records) => records,
            Err(err) => {
                warn!("[solver] failed to list {} for withdrawal: {}", record_name, err);
                return;
            }
        };
        for record in records
            .iter()
            .filter(|record| provider.normalize_value(&record.value) == wanted)
        {
            let deleted = retry_with_backoff(&self.retry, "delete TXT record", || async move {
                provider
                    .delete_record(record)
                    .await
                    .map_err(ReconcileError::from)
            })
            .await;
            match deleted {
                Ok(()) => debug!("[solver] withdrew {} (record {})", record_name, record.id),
                Err(err) => warn!(
                    "[solver] failed to withdraw {} (record {}): {}",
                    record_name, record.id, err
                ),
            }
        }
    }

    /// One-shot check that `value` is observable at `domain`'s challenge name.
    pub async fn observe(&self, domain: &str, value: &str) -> ReconcileResult<bool> {
        let route = self.route_for(domain)?;
        let answers = route.checker.query_txt(&dns::record_name(domain)).await?;
        Ok(dns::interpret_dns_results(&answers, value).state == PropagationState::Found)
    }

    /// Waits until the handle's value is publicly observable.
    pub async fn wait_until_visible(
        &self,
        handle: &ChallengeHandle,
        timeout: Duration,
        interval: Duration,
    ) -> ReconcileResult<DnsPropagationResult> {
        let route = self.route_named(&handle.provider)?;
        dns::wait_for_propagation(
            route.checker.as_ref(),
            &handle.record_name,
            &handle.value,
            timeout,
            interval,
        )
        .await
    }
}
