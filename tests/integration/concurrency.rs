use std::sync::Arc;

use cert_reconciler::core::types::IssuedCertificate;
use cert_reconciler::issuance::csr::inspect_certificate;
use cert_reconciler::issuance::dns_providers::MemoryDnsProvider;
use cert_reconciler::reconciler::{
    DesiredStateSource, Drift, InMemorySource, ReconcilerSettings, TriggerOutcome,
};
use cert_reconciler::secrets::{FileSecretStore, MemorySecretStore, SecretStore};
use rcgen::{CertificateParams, KeyPair};
use tempfile::tempdir;

use crate::support::{self, ScriptedAuthority};

#[tokio::test]
async fn concurrent_triggers_create_one_order() {
    let zone = Arc::new(MemoryDnsProvider::new("zone"));
    let solver = support::solver(&zone);
    let authority = Arc::new(ScriptedAuthority::new(solver.clone()));
    let machine = support::machine(authority.clone(), solver, 0);
    let source = Arc::new(
        InMemorySource::new(vec![support::request("web", &["a.example.com"])]).unwrap(),
    );
    let secrets = Arc::new(MemorySecretStore::new());
    let reconciler =
        support::reconciler(machine, secrets.clone(), source.clone(), ReconcilerSettings::default());
    let wanted = source.get("web").unwrap();

    let triggers = (0..8).map(|_| {
        let reconciler = reconciler.clone();
        let wanted = wanted.clone();
        tokio::spawn(async move { reconciler.trigger(wanted).await })
    });
    let mut started = 0;
    for handle in triggers.collect::<Vec<_>>() {
        match handle.await.unwrap().unwrap() {
            TriggerOutcome::Started(Drift::Missing) => started += 1,
            TriggerOutcome::AlreadyRunning | TriggerOutcome::UpToDate => {}
            other => panic!("unexpected trigger outcome {other:?}"),
        }
    }
    reconciler.wait_idle().await;

    assert_eq!(started, 1);
    assert_eq!(authority.create_calls(), 1);
    assert!(secrets.get("web-tls").await.unwrap().is_some());
}

fn bundle(domain: &str) -> IssuedCertificate {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec![domain.to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    inspect_certificate(&cert.pem(), &key.serialize_pem()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_a_partial_bundle() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FileSecretStore::new(dir.path().to_path_buf()));
    let bundles: Vec<IssuedCertificate> = (0..4).map(|_| bundle("a.example.com")).collect();
    let serials: Vec<String> = bundles.iter().map(|b| b.serial.clone()).collect();
    store.put("web-tls", &bundles[0]).await.unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let serials = serials.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let current = store.get("web-tls").await.unwrap().unwrap();
                    assert!(serials.contains(&current.serial));
                    // Chain and key always come from the same write.
                    let reparsed =
                        inspect_certificate(&current.chain_pem, &current.private_key_pem).unwrap();
                    assert_eq!(reparsed.serial, current.serial);
                }
            })
        })
        .collect();

    for _ in 0..5 {
        for certificate in &bundles {
            store.put("web-tls", certificate).await.unwrap();
        }
    }
    for reader in readers {
        reader.await.unwrap();
    }

    let last = store.get("web-tls").await.unwrap().unwrap();
    assert_eq!(last.serial, serials[3]);
    let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 1);
}
