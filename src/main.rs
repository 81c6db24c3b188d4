use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use cert_reconciler::config::load_config;

#[derive(Debug, Parser)]
#[command(name = "cert-reconciler", version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "CERT_RECONCILER_CONFIG")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Run a single reconcile pass, print request status as JSON and exit.
    #[arg(long, conflicts_with = "check")]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    info!(
        "loaded {} issuer(s), {} dns provider(s), {} request(s) from {}",
        config.issuers.len(),
        config.dns_providers.len(),
        config.requests.len(),
        cli.config.display()
    );

    if cli.check {
        println!("configuration ok");
        return Ok(());
    }

    if cli.once {
        let daemon = cert_reconciler::build_daemon(&config).await?;
        daemon.reconciler.tick().await;
        daemon.reconciler.wait_idle().await;
        let statuses = daemon.reconciler.status_store().list()?;
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    cert_reconciler::run(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    })
    .await
}
