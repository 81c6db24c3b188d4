use std::sync::Arc;
use std::time::Duration;

use cert_reconciler::issuance::authority::{AccountKey, AcmeAuthority};
use cert_reconciler::issuance::dns_providers::MemoryDnsProvider;
use cert_reconciler::issuance::{IssuanceMachine, RetryPolicy};
use tokio_util::sync::CancellationToken;

use crate::acme_server::AcmeServer;
use crate::support;

const DOMAIN: &str = "a.example.com";

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(10),
        jitter: false,
        ..RetryPolicy::default()
    }
}

fn machine(
    server: &AcmeServer,
    zone: &Arc<MemoryDnsProvider>,
    poll_timeout: Duration,
) -> IssuanceMachine {
    let key = AccountKey::generate().unwrap();
    let authority = AcmeAuthority::new("acme", &server.directory_url(), key)
        .with_tos_agreed(true)
        .with_polling(Duration::from_millis(10), poll_timeout);
    IssuanceMachine::new(
        Arc::new(authority),
        support::solver(zone),
        support::timeouts(),
        fast_retry(),
        0,
    )
}

#[tokio::test]
async fn orders_share_one_account_and_reuse_nonces() {
    let server = AcmeServer::start(DOMAIN).await;
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    let machine = machine(&server, &zone, Duration::from_secs(5));
    let request = support::request("web", &[DOMAIN]);

    for _ in 0..2 {
        let outcome = machine.run(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.certificate.domains, vec![DOMAIN.to_string()]);
    }

    assert_eq!(server.accounts(), 1);
    // Every response carries a Replay-Nonce, so newNonce is asked only once.
    assert_eq!(server.nonce_requests(), 1);
    assert_eq!(server.finalize_posts(), 2);
    assert_eq!(server.bad_nonces(), 0);
    assert!(zone.records().is_empty());
}

#[tokio::test]
async fn bad_nonce_is_retried_with_the_returned_nonce() {
    let server = AcmeServer::start(DOMAIN).await;
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    let machine = machine(&server, &zone, Duration::from_secs(5));
    server.reject_next_nonce();

    let outcome = machine
        .run(&support::request("web", &[DOMAIN]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 1);
    assert_eq!(server.bad_nonces(), 1);
    assert_eq!(server.nonce_requests(), 1);
    assert_eq!(server.accounts(), 1);
}

#[tokio::test]
async fn retried_finalize_resumes_the_processing_order() {
    let server = AcmeServer::start(DOMAIN).await;
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    // A zero poll timeout turns the first failed poll into a finalize error.
    let machine = machine(&server, &zone, Duration::ZERO);
    server.fail_polls_while_processing(1);

    let outcome = machine
        .run(&support::request("web", &[DOMAIN]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 1);
    assert_eq!(server.finalize_posts(), 1);
    assert!(zone.records().is_empty());
}
