use std::sync::Arc;

use cert_reconciler::issuance::authority::LocalCertificateAuthority;
use cert_reconciler::issuance::dns_providers::MemoryDnsProvider;
use cert_reconciler::reconciler::{
    Drift, InMemorySource, ReconcilerSettings, RenewalThreshold, TriggerOutcome,
};
use cert_reconciler::secrets::{MemorySecretStore, SecretStore};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::support;

/// Issues a 90-day certificate, then checks renewal with the clock pinned
/// `days` after issuance.
async fn trigger_on_day(days: i64, threshold: RenewalThreshold) -> TriggerOutcome {
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    let solver = support::solver(&zone);
    let ca = LocalCertificateAuthority::generate("local", solver.clone())
        .unwrap()
        .with_lifetime_days(90);
    let machine = support::machine(Arc::new(ca), solver, 0);
    let request = support::request("web", &["a.example.com"]);

    let issued = machine.run(&request, &CancellationToken::new()).await.unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    secrets.put("web-tls", &issued.certificate).await.unwrap();

    let now: DateTime<Utc> = issued.certificate.not_before + chrono::Duration::days(days);
    let settings = ReconcilerSettings {
        threshold,
        clock: Arc::new(move || now),
        ..ReconcilerSettings::default()
    };
    let source = Arc::new(InMemorySource::new(vec![request.clone()]).unwrap());
    let reconciler = support::reconciler(machine, secrets, source, settings);
    let outcome = reconciler.trigger(request).await.unwrap();
    reconciler.wait_idle().await;
    outcome
}

#[tokio::test]
async fn fixed_threshold_renews_on_day_61_not_60() {
    let threshold = RenewalThreshold::Fixed(std::time::Duration::from_secs(30 * 86_400));
    assert_eq!(
        trigger_on_day(60, threshold.clone()).await,
        TriggerOutcome::UpToDate
    );
    assert_eq!(
        trigger_on_day(61, threshold).await,
        TriggerOutcome::Started(Drift::RenewalDue)
    );
}

#[tokio::test]
async fn default_threshold_is_a_third_of_the_lifetime() {
    assert_eq!(
        trigger_on_day(60, RenewalThreshold::default()).await,
        TriggerOutcome::UpToDate
    );
    assert_eq!(
        trigger_on_day(61, RenewalThreshold::default()).await,
        TriggerOutcome::Started(Drift::RenewalDue)
    );
}
