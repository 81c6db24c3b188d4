use cert_reconciler::build_daemon;
use cert_reconciler::config::Config;
use cert_reconciler::core::types::RequestPhase;
use cert_reconciler::reconciler::{DesiredStateSource, Drift, TriggerOutcome};
use cert_reconciler::secrets::{FileSecretStore, SecretStore};
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> Config {
    let raw = serde_json::json!({
        "issuers": [
            {"name": "internal", "kind": "local_ca", "certificate_lifetime_days": 90}
        ],
        "dns_providers": [
            {"name": "zone", "kind": "memory", "suffixes": ["example.com"]}
        ],
        "secret_store": {"kind": "file", "path": dir.join("secrets")},
        "status_db": dir.join("status.sqlite"),
        "requests": [
            {"name": "web", "domains": ["www.example.com", "*.example.com", "example.com"],
             "issuer": "internal", "secret_name": "web-tls"}
        ],
        "timeouts": {"propagation_secs": 30, "propagation_interval_secs": 1}
    });
    let mut config: Config = serde_json::from_value(raw).unwrap();
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn issues_stores_and_settles() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let daemon = build_daemon(&config).await.unwrap();

    daemon.reconciler.tick().await;
    daemon.reconciler.wait_idle().await;

    let status = daemon.reconciler.status("web").unwrap().unwrap();
    assert_eq!(status.phase, RequestPhase::Ready, "{status:?}");
    assert_eq!(status.consecutive_failures, 0);

    let store = FileSecretStore::new(dir.path().join("secrets"));
    let stored = store.get("web-tls").await.unwrap().unwrap();
    assert_eq!(
        stored.domains,
        vec!["*.example.com", "example.com", "www.example.com"]
    );
    assert_eq!(stored.lifetime(), chrono::Duration::days(90));
    assert_eq!(status.serial.as_deref(), Some(stored.serial.as_str()));

    let inventory = daemon.reconciler.status_store().issued_for("web").unwrap();
    assert_eq!(inventory.len(), 1);

    // A second pass finds nothing to do.
    let request = daemon.source.list().remove(0);
    assert_eq!(
        daemon.reconciler.trigger(request).await.unwrap(),
        TriggerOutcome::UpToDate
    );
    daemon.reconciler.tick().await;
    daemon.reconciler.wait_idle().await;
    assert_eq!(daemon.reconciler.status_store().issued_for("web").unwrap().len(), 1);
}

#[tokio::test]
async fn domain_changes_reissue() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let daemon = build_daemon(&config).await.unwrap();
    daemon.reconciler.tick().await;
    daemon.reconciler.wait_idle().await;

    let mut request = daemon.source.get("web").unwrap();
    request.domains.push("api.example.com".into());
    daemon.source.upsert(request).unwrap();
    let changed = daemon.source.get("web").unwrap();
    assert_eq!(
        daemon.reconciler.trigger(changed).await.unwrap(),
        TriggerOutcome::Started(Drift::DomainsChanged)
    );
    daemon.reconciler.wait_idle().await;

    let store = FileSecretStore::new(dir.path().join("secrets"));
    let stored = store.get("web-tls").await.unwrap().unwrap();
    assert!(stored.domains.contains(&"api.example.com".to_string()));
    assert_eq!(daemon.reconciler.status_store().issued_for("web").unwrap().len(), 2);
}
