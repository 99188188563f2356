//! Donation ledger server binary
//!
//! Opens the ledger and runs the reconciliation sweep on an interval until
//! Ctrl-C. Configuration comes from the TOML file given as the first argument,
//! or from `DONATION_LEDGER_*` environment variables.

use anyhow::Context;
use donation_ledger::{Config, Ledger};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting donation ledger server");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };
    let sweep_interval = Duration::from_secs(config.reconciliation.sweep_interval_secs.max(1));

    let ledger = Arc::new(Ledger::open(config).context("Failed to open ledger")?);
    tracing::info!(
        sweep_interval_secs = sweep_interval.as_secs(),
        "Ledger opened successfully"
    );

    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // The sweep backs off on contention with blocking sleeps
                let ledger = Arc::clone(&ledger);
                if let Err(e) = tokio::task::spawn_blocking(move || run_sweep(&ledger)).await {
                    tracing::error!(error = %e, "Reconciliation sweep task panicked");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                break;
            }
        }
    }

    tracing::info!("Shutting down donation ledger server");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if std::env::var("DONATION_LEDGER_LOG_JSON").is_ok() {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run_sweep(ledger: &Ledger) {
    match ledger.reconcile_flagged() {
        Ok(summary) if summary.reports.is_empty() && summary.orphaned.is_empty() => {
            tracing::debug!("Reconciliation sweep found nothing flagged");
        }
        Ok(summary) => match serde_json::to_string(&summary) {
            Ok(json) => tracing::info!(summary = %json, "Reconciliation sweep complete"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode sweep summary"),
        },
        Err(e) => tracing::error!(error = %e, "Reconciliation sweep failed"),
    }

    if let Ok(stats) = ledger.storage_stats() {
        tracing::debug!(
            donations = stats.approx_donations,
            campaigns = stats.approx_campaigns,
            index_entries = stats.approx_index_entries,
            "Storage stats"
        );
    }
}
