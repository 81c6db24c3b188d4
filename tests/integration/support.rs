use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use cert_reconciler::core::error::{ReconcileError, ReconcileResult};
use cert_reconciler::core::types::{
    CertificateRequest, Challenge, IssuedCertificate, KeyAlgorithm, Order, OrderStatus,
};
use cert_reconciler::issuance::authority::{CertificateAuthority, LocalCertificateAuthority};
use cert_reconciler::issuance::csr::CertificateSigningRequest;
use cert_reconciler::issuance::dns_providers::MemoryDnsProvider;
use cert_reconciler::issuance::{ChallengeSolver, IssuanceMachine, IssuanceTimeouts, RetryPolicy};
use cert_reconciler::reconciler::{InMemorySource, Reconciler, ReconcilerSettings};
use cert_reconciler::secrets::{SecretStore, SecretStoreError};
use cert_reconciler::storage::StatusStore;

pub const ZONE: &str = "example.com";

pub fn request(name: &str, domains: &[&str]) -> CertificateRequest {
    CertificateRequest {
        name: name.into(),
        domains: domains.iter().map(|d| d.to_string()).collect(),
        issuer: "local".into(),
        secret_name: format!("{name}-tls"),
        key_algorithm: KeyAlgorithm::EcdsaP256,
    }
}

pub fn solver(zone: &Arc<MemoryDnsProvider>) -> Arc<ChallengeSolver> {
    let mut solver = ChallengeSolver::new(RetryPolicy::default());
    solver.register("zone", &[ZONE.to_string()], zone.clone(), zone.clone());
    Arc::new(solver)
}

pub fn timeouts() -> IssuanceTimeouts {
    IssuanceTimeouts {
        propagation: Duration::from_secs(60),
        propagation_interval: Duration::from_secs(5),
        ..IssuanceTimeouts::default()
    }
}

/// Wraps the local CA, counting orders and answering the first
/// `rate_limits` order requests with a rate-limit error. A rejecting
/// authority refuses every finalize.
pub struct ScriptedAuthority {
    inner: LocalCertificateAuthority,
    rate_limits: AtomicU32,
    retry_after: Duration,
    reject_finalize: AtomicBool,
    create_calls: AtomicUsize,
}

impl ScriptedAuthority {
    pub fn new(solver: Arc<ChallengeSolver>) -> Self {
        Self {
            inner: LocalCertificateAuthority::generate("local", solver).unwrap(),
            rate_limits: AtomicU32::new(0),
            retry_after: Duration::from_secs(30),
            reject_finalize: AtomicBool::new(false),
            create_calls: AtomicUsize::new(0),
        }
    }

    pub fn rate_limited(self, times: u32, retry_after: Duration) -> Self {
        self.rate_limits.store(times, Ordering::SeqCst);
        Self {
            retry_after,
            ..self
        }
    }

    pub fn rejecting(self) -> Self {
        self.reject_finalize.store(true, Ordering::SeqCst);
        self
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn open_orders(&self) -> usize {
        self.inner.open_orders()
    }
}

#[async_trait]
impl CertificateAuthority for ScriptedAuthority {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create_order(&self, domains: &[String]) -> ReconcileResult<Order> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let limited = self
            .rate_limits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if limited {
            return Err(ReconcileError::RateLimited {
                service: "scripted".into(),
                retry_after: Some(self.retry_after),
            });
        }
        // Let a concurrent trigger observe the run in flight.
        tokio::task::yield_now().await;
        self.inner.create_order(domains).await
    }

    async fn get_challenges(&self, order: &Order) -> ReconcileResult<Vec<Challenge>> {
        self.inner.get_challenges(order).await
    }

    async fn notify_ready(&self, challenge: &Challenge) -> ReconcileResult<()> {
        self.inner.notify_ready(challenge).await
    }

    async fn poll_order_status(&self, order: &Order) -> ReconcileResult<OrderStatus> {
        self.inner.poll_order_status(order).await
    }

    async fn finalize(
        &self,
        order: &Order,
        csr: &CertificateSigningRequest,
    ) -> ReconcileResult<IssuedCertificate> {
        if self.reject_finalize.load(Ordering::SeqCst) {
            return Err(ReconcileError::AuthorityRejected(
                "badCSR: key too weak".into(),
            ));
        }
        self.inner.finalize(order, csr).await
    }

    async fn abandon(&self, order: &Order) {
        self.inner.abandon(order).await
    }
}

/// Secret store that refuses every write and holds nothing.
#[derive(Default)]
pub struct RefusingStore {
    puts: AtomicUsize,
}

impl RefusingStore {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for RefusingStore {
    fn kind(&self) -> &'static str {
        "refusing"
    }

    async fn put(&self, name: &str, _certificate: &IssuedCertificate) -> Result<(), SecretStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Err(SecretStoreError::store(name, "read-only filesystem"))
    }

    async fn get(&self, _name: &str) -> Result<Option<Arc<IssuedCertificate>>, SecretStoreError> {
        Ok(None)
    }

    async fn delete(&self, _name: &str) -> Result<(), SecretStoreError> {
        Ok(())
    }
}

pub fn machine(
    authority: Arc<dyn CertificateAuthority>,
    solver: Arc<ChallengeSolver>,
    max_order_retries: u32,
) -> Arc<IssuanceMachine> {
    Arc::new(IssuanceMachine::new(
        authority,
        solver,
        timeouts(),
        RetryPolicy::default(),
        max_order_retries,
    ))
}

pub fn reconciler(
    machine: Arc<IssuanceMachine>,
    secrets: Arc<dyn SecretStore>,
    source: Arc<InMemorySource>,
    settings: ReconcilerSettings,
) -> Arc<Reconciler> {
    Reconciler::new(
        HashMap::from([("local".to_string(), machine)]),
        secrets,
        StatusStore::in_memory().unwrap(),
        source,
        settings,
    )
}
