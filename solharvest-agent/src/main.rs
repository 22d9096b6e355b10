//! Solharvest Agent - photovoltaic telemetry harvester
//!
//! Runs the per-source collection loops by default. Two auxiliary modes:
//! - `solharvest-agent backfill` walks the API history month by month
//! - `solharvest-agent set-web-password` stores the portal password in
//!   the OS keyring (read from stdin, never echoed into the config file)

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use solharvest_agent::cache::CacheStore;
use solharvest_agent::collectors::ApiCollector;
use solharvest_agent::config::{self, AgentConfig};
use solharvest_agent::scheduler::{Scheduler, StatePaths};
use solharvest_agent::stats::StatsTracker;
use solharvest_agent::writer::TimeSeriesWriter;
use solharvest_agent::backfill;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("solharvest_agent=info")),
        )
        .init();

    let mode = std::env::args().nth(1);

    if mode.as_deref() == Some("set-web-password") {
        return set_web_password();
    }

    info!("solharvest agent v{} starting", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load()
        .await
        .context("failed to load configuration")?;

    let data_dir = config::data_dir()?;
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let cache = CacheStore::open(config.cache.resolve_dir()?)?;
    let stats = StatsTracker::new();
    let writer = Arc::new(TimeSeriesWriter::new(
        config.store.clone(),
        config.writer.clone(),
        config.writer.resolve_spill_path()?,
        stats.clone(),
    )?);
    let paths = StatePaths {
        quota_ledger: data_dir.join("quota.json"),
        web_session: data_dir.join("web-session.json"),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    if mode.as_deref() == Some("backfill") {
        let api_cfg = config
            .api
            .clone()
            .context("backfill requires an [api] section")?;
        api_cfg.validate().context("api source config invalid")?;
        let collector = ApiCollector::new(api_cfg.clone(), cache, paths.quota_ledger.clone())?;

        let summary =
            backfill::run(&api_cfg, &collector, &writer, &stats, &shutdown_rx).await?;
        if summary.quota_exhausted {
            info!("quota exhausted mid-backfill; rerun after the window resets to continue");
        }
        return Ok(());
    }

    let flush_task = TimeSeriesWriter::spawn_flush_task(writer.clone(), shutdown_rx.clone());
    let scheduler = Scheduler::start(
        &config,
        cache,
        writer.clone(),
        stats.clone(),
        &paths,
        shutdown_rx,
    );
    if scheduler.active_sources().is_empty() {
        anyhow::bail!("no usable telemetry sources configured, nothing to do");
    }

    scheduler.wait().await;
    // The flush task drains the last batch on the same shutdown signal.
    let _ = flush_task.await;

    let snapshot = stats.snapshot();
    info!(
        "agent stopped: {} points written, {} spilled, {} flush failures",
        snapshot.writer.points_written,
        snapshot.writer.points_spilled,
        snapshot.writer.flush_failures
    );
    Ok(())
}

/// Read the portal password from stdin and store it in the OS keyring.
fn set_web_password() -> Result<()> {
    eprintln!("portal password (will not be stored in the config file):");
    let mut password = String::new();
    std::io::stdin()
        .read_line(&mut password)
        .context("failed to read password from stdin")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("empty password");
    }

    config::save_keyring_secret("web-portal", password)?;
    eprintln!("saved to keyring");
    Ok(())
}
