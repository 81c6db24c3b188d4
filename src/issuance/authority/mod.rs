//! Certificate authority backends.

pub mod acme;
pub mod jws;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;

use crate::config::{AuthorityConfig, IssuerConfig};
use crate::core::error::ReconcileResult;
use crate::core::types::{Challenge, IssuedCertificate, Order, OrderStatus};
use crate::issuance::csr::CertificateSigningRequest;
use crate::issuance::machine::IssuanceTimeouts;
use crate::issuance::solver::ChallengeSolver;

pub use acme::AcmeAuthority;
pub use jws::AccountKey;
pub use local::LocalCertificateAuthority;

/// Order, validate and finalize against one issuer.
///
/// Implementations report failures through [`ReconcileError`] kinds and do
/// not retry on their own; the issuance machine drives every call through
/// its retry policy.
///
/// [`ReconcileError`]: crate::core::error::ReconcileError
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    fn name(&self) -> &str;

    async fn create_order(&self, domains: &[String]) -> ReconcileResult<Order>;

    /// One DNS-01 challenge per domain of `order`.
    async fn get_challenges(&self, order: &Order) -> ReconcileResult<Vec<Challenge>>;

    /// Tells the authority the challenge record is in place.
    async fn notify_ready(&self, challenge: &Challenge) -> ReconcileResult<()>;

    async fn poll_order_status(&self, order: &Order) -> ReconcileResult<OrderStatus>;

    /// Submits `csr` and returns the issued chain paired with the CSR's key.
    async fn finalize(
        &self,
        order: &Order,
        csr: &CertificateSigningRequest,
    ) -> ReconcileResult<IssuedCertificate>;

    /// Releases state kept for an order whose attempt ended without a
    /// certificate. ACME servers expire such orders on their own.
    async fn abandon(&self, _order: &Order) {}
}

/// Builds the backend for `config`. The local CA observes challenge records
/// through `solver`.
pub fn build_authority(
    config: &IssuerConfig,
    solver: Arc<ChallengeSolver>,
    timeouts: &IssuanceTimeouts,
) -> ReconcileResult<Arc<dyn CertificateAuthority>> {
    match &config.authority {
        AuthorityConfig::Acme {
            directory_url,
            contact_email,
            account_key,
            tos_agreed,
        } => {
            let key = match account_key {
                Some(source) => AccountKey::from_pem(source.resolve()?.as_bytes())?,
                None => {
                    warn!(
                        "[acme] issuer '{}' has no account key configured; using an ephemeral key",
                        config.name
                    );
                    AccountKey::generate()?
                }
            };
            let authority = AcmeAuthority::new(&config.name, directory_url, key)
                .with_contact(contact_email.clone())
                .with_tos_agreed(*tos_agreed)
                .with_polling(timeouts.authority_poll_interval, timeouts.authority_poll);
            Ok(Arc::new(authority))
        }
        AuthorityConfig::LocalCa {
            ca_cert,
            ca_key,
            certificate_lifetime_days,
        } => {
            let authority = match (ca_cert, ca_key) {
                (Some(cert), Some(key)) => LocalCertificateAuthority::from_pem(
                    &config.name,
                    cert.resolve()?.as_bytes(),
                    key.resolve()?.as_bytes(),
                    solver,
                )?,
                _ => {
                    warn!(
                        "[local-ca] issuer '{}' has no CA material configured; generating a throwaway CA",
                        config.name
                    );
                    LocalCertificateAuthority::generate(&config.name, solver)?
                }
            };
            Ok(Arc::new(
                authority
                    .with_lifetime_days(*certificate_lifetime_days)
                    .with_order_ttl(timeouts.order_deadline),
            ))
        }
    }
}
