//! Live provider checks. Each test needs real credentials in the
//! environment and cleans up every record it creates.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use cert_reconciler::issuance::dns::DohPropagationChecker;
use cert_reconciler::issuance::dns_providers::{
    CloudflareProvider, DigitalOceanProvider, DnsProvider,
};
use cert_reconciler::issuance::{ChallengeSolver, RetryPolicy};

struct LiveZone {
    token: String,
    zone: String,
}

fn load(token_var: &str, zone_var: &str) -> Result<LiveZone> {
    Ok(LiveZone {
        token: env::var(token_var).with_context(|| format!("{token_var} not set"))?,
        zone: env::var(zone_var).with_context(|| format!("{zone_var} not set"))?,
    })
}

fn domain(zone: &str, label: &str) -> String {
    format!("integration-test.{label}.{zone}")
}

/// Presents a record twice, checks a single record exists with the
/// expected value, then removes it.
async fn present_and_cleanup(name: &str, zone: &str, provider: Arc<dyn DnsProvider>) -> Result<()> {
    let mut solver = ChallengeSolver::new(RetryPolicy::default());
    solver.register(
        name,
        &[zone.to_string()],
        provider.clone(),
        Arc::new(DohPropagationChecker::default()),
    );
    let domain = domain(zone, "present");
    let value = format!("integration-test-{}", uuid::Uuid::new_v4().simple());

    let handle = solver.present(&domain, &value).await?;
    let again = solver.present(&domain, &value).await?;
    let records = provider.list_records(&handle.record_name).await?;
    let matching = records
        .iter()
        .filter(|record| provider.normalize_value(&record.value) == value)
        .count();
    solver.cleanup_all(std::slice::from_ref(&handle)).await;
    if again.record_id != handle.record_id || matching != 1 {
        return Err(anyhow!(
            "expected one record for {}, found {matching}",
            handle.record_name
        ));
    }

    let left = provider.list_records(&handle.record_name).await?;
    if left
        .iter()
        .any(|record| provider.normalize_value(&record.value) == value)
    {
        return Err(anyhow!("record {} survived cleanup", handle.record_name));
    }
    Ok(())
}

#[tokio::test]
async fn cloudflare_present_is_idempotent() -> Result<()> {
    let live = load("DNS_TEST_CLOUDFLARE_TOKEN", "DNS_TEST_CLOUDFLARE_ZONE")?;
    let provider = Arc::new(CloudflareProvider::new(live.token));
    present_and_cleanup("cloudflare", &live.zone, provider).await
}

#[tokio::test]
async fn digitalocean_present_is_idempotent() -> Result<()> {
    let live = load("DNS_TEST_DIGITALOCEAN_TOKEN", "DNS_TEST_DIGITALOCEAN_DOMAIN")?;
    let provider = Arc::new(DigitalOceanProvider::new(
        live.token,
        vec![live.zone.clone()],
    ));
    present_and_cleanup("digitalocean", &live.zone, provider).await
}
