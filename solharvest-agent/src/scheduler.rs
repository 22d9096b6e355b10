//! Per-source polling loops
//!
//! Each configured source kind runs on its own task with its own interval,
//! so a slow or dead source never delays the others. A source whose config
//! fails validation is logged and left out; the rest still start. Cycles
//! that overrun their interval restart immediately without trying to catch
//! up on missed ticks.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::CacheStore;
use crate::collectors::{ApiCollector, RealtimeCollector, WebCollector};
use crate::config::{AgentConfig, EndpointDescriptor};
use crate::filter;
use crate::model::SourceKind;
use crate::normalize;
use crate::stats::{LoopPhase, StatsTracker};
use crate::writer::TimeSeriesWriter;

/// On-disk state locations shared with the collectors.
pub struct StatePaths {
    pub quota_ledger: PathBuf,
    pub web_session: PathBuf,
}

pub struct Scheduler {
    active: Vec<SourceKind>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Validate each configured source and spawn a loop for the valid
    /// ones. Returns even when every source is rejected; the caller
    /// decides whether an idle agent is worth keeping alive.
    pub fn start(
        config: &AgentConfig,
        cache: CacheStore,
        writer: Arc<TimeSeriesWriter>,
        stats: StatsTracker,
        paths: &StatePaths,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut active = Vec::new();
        let mut handles = Vec::new();

        if let Some(api_cfg) = &config.api {
            match api_cfg.validate().and_then(|_| {
                ApiCollector::new(api_cfg.clone(), cache.clone(), paths.quota_ledger.clone())
            }) {
                Ok(collector) => {
                    let interval = Duration::from_secs(api_cfg.poll_interval_minutes * 60);
                    let descriptors = enabled(&api_cfg.endpoints);
                    info!(
                        "api source: {} endpoints every {}m, quota {}/day",
                        descriptors.len(),
                        api_cfg.poll_interval_minutes,
                        api_cfg.daily_quota
                    );
                    active.push(SourceKind::Api);
                    handles.push(tokio::spawn(source_loop(
                        SourceCollector::Api(collector),
                        descriptors,
                        interval,
                        writer.clone(),
                        stats.clone(),
                        shutdown.clone(),
                    )));
                }
                Err(e) => error!("api source disabled: {:#}", e),
            }
        }

        if let Some(web_cfg) = &config.web {
            match web_cfg.validate().and_then(|_| {
                WebCollector::new(web_cfg.clone(), cache.clone(), paths.web_session.clone())
            }) {
                Ok(collector) => {
                    let interval = Duration::from_secs(web_cfg.poll_interval_minutes * 60);
                    let descriptors = enabled(&web_cfg.endpoints);
                    info!(
                        "web source: {} endpoints every {}m",
                        descriptors.len(),
                        web_cfg.poll_interval_minutes
                    );
                    active.push(SourceKind::Web);
                    handles.push(tokio::spawn(source_loop(
                        SourceCollector::Web(collector),
                        descriptors,
                        interval,
                        writer.clone(),
                        stats.clone(),
                        shutdown.clone(),
                    )));
                }
                Err(e) => error!("web source disabled: {:#}", e),
            }
        }

        if let Some(modbus_cfg) = &config.modbus {
            match modbus_cfg.validate() {
                Ok(()) => {
                    let collector = RealtimeCollector::new(modbus_cfg.clone());
                    let interval = Duration::from_secs(modbus_cfg.poll_interval_seconds);
                    let descriptors = enabled(&modbus_cfg.endpoints);
                    info!(
                        "modbus source: {} endpoints every {}s",
                        descriptors.len(),
                        modbus_cfg.poll_interval_seconds
                    );
                    active.push(SourceKind::Modbus);
                    handles.push(tokio::spawn(source_loop(
                        SourceCollector::Modbus(collector),
                        descriptors,
                        interval,
                        writer.clone(),
                        stats.clone(),
                        shutdown.clone(),
                    )));
                }
                Err(e) => error!("modbus source disabled: {:#}", e),
            }
        }

        Self { active, handles }
    }

    /// Source kinds whose loops actually started.
    pub fn active_sources(&self) -> &[SourceKind] {
        &self.active
    }

    /// Wait for every loop to finish (they exit on the shutdown signal).
    pub async fn wait(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("source loop panicked: {}", e);
            }
        }
    }
}

fn enabled(descriptors: &[EndpointDescriptor]) -> Vec<EndpointDescriptor> {
    descriptors.iter().filter(|d| d.enabled).cloned().collect()
}

/// One concrete collector behind a single loop body. An enum instead of a
/// trait object because `tokio::spawn` needs the collect future to be Send.
enum SourceCollector {
    Api(ApiCollector),
    Web(WebCollector),
    Modbus(RealtimeCollector),
}

impl SourceCollector {
    fn kind(&self) -> SourceKind {
        match self {
            Self::Api(_) => SourceKind::Api,
            Self::Web(_) => SourceKind::Web,
            Self::Modbus(_) => SourceKind::Modbus,
        }
    }

    async fn collect(&self, descriptor: &EndpointDescriptor) -> crate::model::RawPayload {
        match self {
            Self::Api(c) => c.collect(descriptor).await,
            Self::Web(c) => c.collect(descriptor).await,
            Self::Modbus(c) => c.collect(descriptor).await,
        }
    }
}

async fn source_loop(
    collector: SourceCollector,
    descriptors: Vec<EndpointDescriptor>,
    interval: Duration,
    writer: Arc<TimeSeriesWriter>,
    stats: StatsTracker,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = collector.kind();
    loop {
        let started = Instant::now();
        stats.record_run_times(
            kind,
            Utc::now(),
            Utc::now() + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero()),
        );

        for descriptor in &descriptors {
            if *shutdown.borrow() {
                return;
            }
            stats.set_phase(kind, LoopPhase::Collecting);
            let payload = collector.collect(descriptor).await;
            stats.record_outcome(kind, &payload.outcome);
            process_payload(kind, descriptor, payload, &writer, &stats).await;
        }

        stats.set_phase(kind, LoopPhase::Sleeping);
        if !sleep_remainder(kind, interval, started, &mut shutdown).await {
            return;
        }
    }
}

/// Normalize, filter and enqueue one collected payload.
async fn process_payload(
    kind: SourceKind,
    descriptor: &EndpointDescriptor,
    payload: crate::model::RawPayload,
    writer: &TimeSeriesWriter,
    stats: &StatsTracker,
) {
    if !payload.is_success() {
        return;
    }

    stats.set_phase(kind, LoopPhase::Normalizing);
    let points = normalize::normalize(descriptor, &payload);
    let report = filter::filter(descriptor, points);

    stats.set_phase(kind, LoopPhase::Writing);
    let kept = report.kept.len() as u64;
    let dropped = report.dropped();
    writer.enqueue(report.kept).await;
    stats.record_points(kind, kept, dropped);
}

/// Sleep out the rest of the cycle interval. A cycle that overran its
/// interval restarts immediately; missed ticks are not replayed. Returns
/// false when the shutdown signal fired during the sleep.
async fn sleep_remainder(
    kind: SourceKind,
    interval: Duration,
    started: Instant,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    let elapsed = started.elapsed();
    if elapsed > interval {
        warn!(
            "{} cycle took {:.1}s, longer than its {:.0}s interval",
            kind,
            elapsed.as_secs_f64(),
            interval.as_secs_f64()
        );
    }
    let remaining = interval.saturating_sub(elapsed);

    tokio::select! {
        _ = tokio::time::sleep(remaining) => true,
        _ = shutdown.changed() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use tempfile::tempdir;

    fn paths_in(dir: &std::path::Path) -> StatePaths {
        StatePaths {
            quota_ledger: dir.join("quota.json"),
            web_session: dir.join("session.json"),
        }
    }

    #[tokio::test]
    async fn test_invalid_source_is_isolated() {
        // API section has no key; modbus is fine. The scheduler must start
        // the modbus loop anyway.
        let config = AgentConfig::from_toml(
            r#"
            [store]
            url = "http://127.0.0.1:8086"
            org = "home"
            bucket = "solar"

            [api]
            base_url = "https://api.example.com"
            site_id = "1234"

            [[api.endpoints]]
            id = "site-energy"
            device_id = "site-1234"

            [modbus]
            host = "127.0.0.1"
            port = 1502

            [[modbus.endpoints]]
            id = "inverter"
            device_id = "inv-1"

            [[modbus.endpoints.measurements]]
            name = "ac_power"
            register = 40083
            "#,
        )
        .unwrap();

        let dir = tempdir().unwrap();
        let stats = StatsTracker::new();
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();
        let writer = Arc::new(
            TimeSeriesWriter::new(
                config.store.clone(),
                config.writer.clone(),
                dir.path().join("spill.jsonl"),
                stats.clone(),
            )
            .unwrap(),
        );
        let (tx, rx) = watch::channel(false);

        // Meaningful only without the env override.
        if std::env::var("SOLHARVEST_API_KEY").is_ok() {
            return;
        }

        let scheduler = Scheduler::start(&config, cache, writer, stats, &paths_in(dir.path()), rx);
        assert_eq!(scheduler.active_sources(), &[SourceKind::Modbus]);

        tx.send(true).unwrap();
        scheduler.wait().await;
    }

    #[tokio::test]
    async fn test_source_loop_exits_before_collecting_on_shutdown() {
        let config = AgentConfig::from_toml(
            r#"
            [store]
            url = "http://127.0.0.1:8086"
            org = "home"
            bucket = "solar"

            [modbus]
            host = "127.0.0.1"
            port = 9

            [[modbus.endpoints]]
            id = "inverter"
            device_id = "inv-1"

            [[modbus.endpoints.measurements]]
            name = "ac_power"
            register = 40083
            "#,
        )
        .unwrap();
        let modbus_cfg = config.modbus.clone().unwrap();

        let dir = tempdir().unwrap();
        let stats = StatsTracker::new();
        let writer = Arc::new(
            TimeSeriesWriter::new(
                config.store.clone(),
                config.writer.clone(),
                dir.path().join("spill.jsonl"),
                stats.clone(),
            )
            .unwrap(),
        );

        let collector = SourceCollector::Modbus(RealtimeCollector::new(modbus_cfg.clone()));
        assert_eq!(collector.kind(), SourceKind::Modbus);

        // Shutdown already signalled: the loop must return without touching
        // the (unreachable) device.
        let (_tx, rx) = watch::channel(true);
        source_loop(
            collector,
            enabled(&modbus_cfg.endpoints),
            Duration::from_secs(3600),
            writer,
            stats.clone(),
            rx,
        )
        .await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sources[&SourceKind::Modbus].attempted, 0);
    }

    #[tokio::test]
    async fn test_sleep_remainder_honors_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let started = Instant::now();

        let handle = tokio::spawn(async move {
            sleep_remainder(SourceKind::Modbus, Duration::from_secs(3600), started, &mut rx).await
        });
        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        assert!(!handle.await.unwrap());
    }
}
