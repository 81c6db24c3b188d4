use std::sync::Arc;
use std::time::Duration;

use cert_reconciler::core::error::ErrorKind;
use cert_reconciler::core::types::{IssuanceState, RequestPhase};
use cert_reconciler::issuance::RetryPolicy;
use cert_reconciler::issuance::authority::LocalCertificateAuthority;
use cert_reconciler::issuance::dns_providers::MemoryDnsProvider;
use cert_reconciler::reconciler::{Drift, InMemorySource, ReconcilerSettings, TriggerOutcome};
use cert_reconciler::secrets::{MemorySecretStore, SecretStore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::support::{self, RefusingStore, ScriptedAuthority};

#[tokio::test(start_paused = true)]
async fn rate_limit_waits_without_failing_the_order() {
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    let solver = support::solver(&zone);
    let authority = Arc::new(
        ScriptedAuthority::new(solver.clone()).rate_limited(1, Duration::from_secs(30)),
    );
    let machine = support::machine(authority.clone(), solver, 0);

    let started = Instant::now();
    let outcome = machine
        .run(&support::request("web", &["a.example.com"]), &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(authority.create_calls(), 2);
    assert!(
        outcome
            .history
            .iter()
            .all(|transition| transition.state != IssuanceState::Failed)
    );
    assert!(zone.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn propagation_timeout_marks_request_failed_and_cleans_up() {
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    zone.set_visible(false);
    let solver = support::solver(&zone);
    let ca = Arc::new(LocalCertificateAuthority::generate("local", solver.clone()).unwrap());
    let machine = support::machine(ca.clone(), solver, 2);
    let source = Arc::new(
        InMemorySource::new(vec![support::request("web", &["a.example.com", "b.example.com"])])
            .unwrap(),
    );
    let secrets = Arc::new(MemorySecretStore::new());
    let reconciler = support::reconciler(
        machine,
        secrets.clone(),
        source.clone(),
        ReconcilerSettings::default(),
    );

    reconciler.tick().await;
    reconciler.wait_idle().await;

    let status = reconciler.status("web").unwrap().unwrap();
    assert_eq!(status.phase, RequestPhase::PermanentlyFailed);
    assert_eq!(
        status.last_error_kind,
        Some(ErrorKind::ChallengePropagationTimeout)
    );
    assert!(zone.records().is_empty());
    // Three attempts, two records each, every one removed again.
    assert_eq!(zone.create_calls(), 6);
    assert_eq!(zone.delete_calls(), 6);
    assert_eq!(ca.open_orders(), 0);
    assert!(secrets.get("web-tls").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn rejection_fails_after_one_attempt() {
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    let solver = support::solver(&zone);
    let authority = Arc::new(ScriptedAuthority::new(solver.clone()).rejecting());
    let machine = support::machine(authority.clone(), solver, 3);
    let source = Arc::new(InMemorySource::new(vec![support::request("web", &["a.example.com"])]).unwrap());
    let reconciler = support::reconciler(
        machine,
        Arc::new(MemorySecretStore::new()),
        source,
        ReconcilerSettings::default(),
    );

    reconciler.tick().await;
    reconciler.wait_idle().await;

    let status = reconciler.status("web").unwrap().unwrap();
    assert_eq!(status.phase, RequestPhase::PermanentlyFailed);
    assert_eq!(status.last_error_kind, Some(ErrorKind::AuthorityRejected));
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.last_error.unwrap().contains("badCSR"));
    assert_eq!(authority.create_calls(), 1);
    assert_eq!(authority.open_orders(), 0);
    assert!(zone.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unwritable_secret_is_retried_without_reissuing() {
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    let solver = support::solver(&zone);
    let authority = Arc::new(ScriptedAuthority::new(solver.clone()));
    let machine = support::machine(authority.clone(), solver, 0);
    let source = Arc::new(InMemorySource::new(Vec::new()).unwrap());
    let store = Arc::new(RefusingStore::default());
    let reconciler = support::reconciler(
        machine,
        store.clone(),
        source,
        ReconcilerSettings {
            secret_retry: RetryPolicy::with_max_attempts(2),
            ..ReconcilerSettings::default()
        },
    );
    let wanted = support::request("web", &["a.example.com"]);

    for pass in 1..=2u32 {
        assert_eq!(
            reconciler.trigger(wanted.clone()).await.unwrap(),
            TriggerOutcome::Started(Drift::Missing)
        );
        reconciler.wait_idle().await;
        let status = reconciler.status("web").unwrap().unwrap();
        assert_eq!(status.phase, RequestPhase::Failed);
        assert_eq!(status.last_error_kind, Some(ErrorKind::SecretStoreWriteFailure));
        assert_eq!(status.consecutive_failures, pass);
    }

    assert_eq!(authority.create_calls(), 1);
    assert_eq!(store.puts(), 4);
}

#[tokio::test]
async fn deleting_a_request_cancels_its_run() {
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    zone.set_visible(false);
    let solver = support::solver(&zone);
    let ca = LocalCertificateAuthority::generate("local", solver.clone()).unwrap();
    let machine = support::machine(Arc::new(ca), solver, 0);
    let source = Arc::new(InMemorySource::new(Vec::new()).unwrap());
    let reconciler = support::reconciler(
        machine,
        Arc::new(MemorySecretStore::new()),
        source.clone(),
        ReconcilerSettings::default(),
    );

    let outcome = reconciler
        .trigger(support::request("web", &["a.example.com"]))
        .await
        .unwrap();
    assert!(matches!(outcome, TriggerOutcome::Started(_)));
    // Give the run time to publish its record.
    while zone.create_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    reconciler.remove("web").await;
    assert!(reconciler.in_flight().await.is_empty());
    assert!(zone.records().is_empty());
    assert!(reconciler.status("web").unwrap().is_none());
}
