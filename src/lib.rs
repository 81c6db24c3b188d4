pub mod config;
pub mod core;
pub mod domain;
pub mod issuance;
pub mod reconciler;
pub mod secrets;
pub mod storage;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use config::{Config, PropagationCheck};
use issuance::authority::build_authority;
use issuance::dns::{
    AuthoritativePropagationChecker, DohPropagationChecker, PropagationChecker,
};
use issuance::dns_providers::create_provider;
use issuance::{ChallengeSolver, IssuanceMachine};
use reconciler::{InMemorySource, Reconciler, ReconcilerSettings};
use secrets::create_secret_store;
use storage::StatusStore;

/// Everything the daemon runs, wired from one configuration.
pub struct Daemon {
    pub reconciler: Arc<Reconciler>,
    pub source: Arc<InMemorySource>,
}

/// Resolves credentials, connects providers and stores, and builds one
/// issuance machine per issuer.
pub async fn build_daemon(config: &Config) -> Result<Daemon> {
    let retry = config.retry.to_policy();
    let default_checker: Arc<dyn PropagationChecker> = match config.propagation_check {
        PropagationCheck::Authoritative => Arc::new(AuthoritativePropagationChecker::new()),
        PropagationCheck::PublicResolvers => Arc::new(DohPropagationChecker::default()),
    };

    let mut solver = ChallengeSolver::new(retry.clone());
    for provider in &config.dns_providers {
        let configured = create_provider(provider)
            .await
            .with_context(|| format!("dns provider '{}'", provider.name))?;
        let checker = configured
            .checker
            .unwrap_or_else(|| default_checker.clone());
        solver.register(&provider.name, &provider.suffixes, configured.provider, checker);
        info!(
            "[setup] dns provider '{}' ({}) for {:?}",
            provider.name,
            provider.provider.as_str(),
            provider.suffixes
        );
    }
    let solver = Arc::new(solver);

    let timeouts = config.timeouts.to_timeouts();
    let mut machines = HashMap::new();
    for issuer in &config.issuers {
        let authority = build_authority(issuer, solver.clone(), &timeouts)
            .with_context(|| format!("issuer '{}'", issuer.name))?;
        machines.insert(
            issuer.name.clone(),
            Arc::new(IssuanceMachine::new(
                authority,
                solver.clone(),
                timeouts.clone(),
                retry.clone(),
                config.retry.max_order_retries,
            )),
        );
        info!("[setup] issuer '{}' ready", issuer.name);
    }

    let secrets = create_secret_store(&config.secret_store)
        .await
        .context("failed to open secret store")?;
    let status = match &config.status_db {
        Some(path) => StatusStore::open(path)?,
        None => StatusStore::in_memory()?,
    };
    let source = Arc::new(InMemorySource::new(config.requests.clone())?);

    let settings = ReconcilerSettings {
        threshold: config.renewal.threshold(),
        check_interval: config.renewal.check_interval(),
        failure_backoff: config.renewal.failure_backoff(),
        secret_retry: retry,
        ..Default::default()
    };
    let reconciler = Reconciler::new(machines, secrets, status, source.clone(), settings);
    Ok(Daemon { reconciler, source })
}

/// Runs the reconcile loop until `shutdown` resolves.
pub async fn run(config: Config, shutdown: impl Future<Output = ()>) -> Result<()> {
    let daemon = build_daemon(&config).await?;
    daemon.reconciler.run(shutdown).await;
    info!("[setup] stopped");
    Ok(())
}
