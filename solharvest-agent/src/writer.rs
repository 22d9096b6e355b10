//! Batched time-series writer (InfluxDB v2 line protocol)
//!
//! Points accumulate in a bounded batch flushed on size or time. A failed
//! flush is retried with exponential backoff; once retries are exhausted
//! the points go to a durable spill file and the batch is cleared so the
//! pipeline never deadlocks on an unavailable store. The batch lock is
//! held only to push or swap points, never across a network call.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::config::{StoreConfig, WriterConfig};
use crate::model::MeasurementPoint;
use crate::stats::StatsTracker;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store rejected batch: {0}")]
    Status(reqwest::StatusCode),
}

struct WriteBatch {
    points: Vec<MeasurementPoint>,
    last_flush: Instant,
}

pub struct TimeSeriesWriter {
    client: reqwest::Client,
    store: StoreConfig,
    cfg: WriterConfig,
    spill_path: PathBuf,
    batch: tokio::sync::Mutex<WriteBatch>,
    /// Last timestamp seen per device+measurement series, for
    /// out-of-order flagging.
    last_seen: parking_lot::Mutex<HashMap<(String, String), DateTime<Utc>>>,
    stats: StatsTracker,
}

impl TimeSeriesWriter {
    pub fn new(
        store: StoreConfig,
        cfg: WriterConfig,
        spill_path: PathBuf,
        stats: StatsTracker,
    ) -> Result<Self> {
        // The client connects lazily on first flush and pools the
        // connection for the process lifetime.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build()
            .context("failed to build store HTTP client")?;

        Ok(Self {
            client,
            store,
            cfg,
            spill_path,
            batch: tokio::sync::Mutex::new(WriteBatch {
                points: Vec::new(),
                last_flush: Instant::now(),
            }),
            last_seen: parking_lot::Mutex::new(HashMap::new()),
            stats,
        })
    }

    /// Add points to the current batch; triggers a size-based flush when
    /// the threshold is reached.
    pub async fn enqueue(&self, points: Vec<MeasurementPoint>) {
        if points.is_empty() {
            return;
        }
        self.flag_out_of_order(&points);

        let full = {
            let mut batch = self.batch.lock().await;
            batch.points.extend(points);
            if batch.points.len() >= self.cfg.batch_size {
                batch.last_flush = Instant::now();
                Some(std::mem::take(&mut batch.points))
            } else {
                None
            }
        };

        if let Some(points) = full {
            self.flush_points(points).await;
        }
    }

    /// Time-based flush check, driven by the background flush task.
    pub async fn maybe_flush(&self) {
        let interval = Duration::from_secs(self.cfg.flush_interval_secs);
        let due = {
            let mut batch = self.batch.lock().await;
            if !batch.points.is_empty() && batch.last_flush.elapsed() >= interval {
                batch.last_flush = Instant::now();
                Some(std::mem::take(&mut batch.points))
            } else {
                None
            }
        };

        if let Some(points) = due {
            self.flush_points(points).await;
        }
    }

    /// Flush whatever is pending right now (shutdown path).
    pub async fn flush(&self) {
        let points = {
            let mut batch = self.batch.lock().await;
            batch.last_flush = Instant::now();
            std::mem::take(&mut batch.points)
        };
        if !points.is_empty() {
            self.flush_points(points).await;
        }
    }

    /// Background task driving time-based flushes; drains the batch one
    /// last time when the shutdown signal fires.
    pub fn spawn_flush_task(
        writer: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => writer.maybe_flush().await,
                    _ = shutdown.changed() => {
                        writer.flush().await;
                        break;
                    }
                }
            }
        })
    }

    async fn flush_points(&self, points: Vec<MeasurementPoint>) {
        let body = encode_batch(&points);
        let mut delay = Duration::from_millis(self.cfg.backoff_base_ms);

        for attempt in 0..=self.cfg.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            match self.write_request(&body).await {
                Ok(()) => {
                    debug!("flushed {} points", points.len());
                    self.stats.record_written(points.len() as u64);
                    return;
                }
                Err(e) => {
                    self.stats.record_flush_failure();
                    warn!(
                        "flush attempt {}/{} failed: {}",
                        attempt + 1,
                        self.cfg.max_retries + 1,
                        e
                    );
                }
            }
        }

        error!(
            "flush retries exhausted, spilling {} points to {}",
            points.len(),
            self.spill_path.display()
        );
        self.spill(&points).await;
    }

    async fn write_request(&self, body: &str) -> Result<(), WriteError> {
        let url = format!("{}/api/v2/write", self.store.url.trim_end_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .query(&[
                ("org", self.store.org.as_str()),
                ("bucket", self.store.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body.to_string());
        if let Some(token) = self.store.resolve_token() {
            request = request.header(AUTHORIZATION, format!("Token {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WriteError::Status(status));
        }
        Ok(())
    }

    /// Append-only durable fallback, one JSON point per line, same schema
    /// as the in-memory model for later replay.
    async fn spill(&self, points: &[MeasurementPoint]) {
        let mut lines = String::new();
        for point in points {
            match serde_json::to_string(point) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(e) => warn!("failed to serialize spill point: {}", e),
            }
        }

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.spill_path)
                .await?;
            file.write_all(lines.as_bytes()).await?;
            file.flush().await
        }
        .await;

        match result {
            Ok(()) => self.stats.record_spilled(points.len() as u64),
            Err(e) => error!(
                "failed to write spill file {}: {} ({} points lost)",
                self.spill_path.display(),
                e,
                points.len()
            ),
        }
    }

    /// Out-of-order points within a device+measurement series are flagged
    /// and counted, never dropped.
    fn flag_out_of_order(&self, points: &[MeasurementPoint]) {
        let mut flagged = 0u64;
        let mut last_seen = self.last_seen.lock();
        for point in points {
            let key = (point.device_id.clone(), point.measurement.clone());
            match last_seen.get(&key) {
                Some(&prev) if point.timestamp < prev => {
                    warn!(
                        "out-of-order point {}/{}: {} < {}",
                        point.device_id, point.measurement, point.timestamp, prev
                    );
                    flagged += 1;
                }
                _ => {
                    last_seen.insert(key, point.timestamp);
                }
            }
        }
        drop(last_seen);
        if flagged > 0 {
            self.stats.record_out_of_order(flagged);
        }
    }
}

// ===== Line protocol encoding =====

pub fn encode_batch(points: &[MeasurementPoint]) -> String {
    points
        .iter()
        .map(encode_point)
        .collect::<Vec<_>>()
        .join("\n")
}

/// `measurement,device=..,source=..[,unit=..] value=.. timestamp_ns`
pub fn encode_point(point: &MeasurementPoint) -> String {
    let mut line = escape_key(&point.measurement);
    line.push_str(",device=");
    line.push_str(&escape_key(&point.device_id));
    line.push_str(",source=");
    line.push_str(&point.source_kind.to_string());
    if !point.unit.is_empty() {
        line.push_str(",unit=");
        line.push_str(&escape_key(&point.unit));
    }
    line.push_str(" value=");
    line.push_str(&format_value(point.value));
    line.push(' ');
    line.push_str(&timestamp_ns(point.timestamp).to_string());
    line
}

/// Escape for measurement names and tag keys/values.
fn escape_key(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn format_value(v: f64) -> String {
    format!("{v}")
}

fn timestamp_ns(ts: DateTime<Utc>) -> i64 {
    // Nanosecond precision overflows around year 2262; fall back to
    // microsecond-derived nanoseconds for out-of-range timestamps.
    ts.timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;
    use chrono::TimeZone;

    fn point_at(ts: DateTime<Utc>, value: f64) -> MeasurementPoint {
        MeasurementPoint {
            measurement: "ac_power".to_string(),
            device_id: "inv-1".to_string(),
            timestamp: ts,
            value,
            unit: "W".to_string(),
            source_kind: SourceKind::Modbus,
        }
    }

    fn test_writer(url: &str, max_retries: u32, spill: PathBuf) -> TimeSeriesWriter {
        TimeSeriesWriter::new(
            StoreConfig {
                url: url.to_string(),
                org: "home".to_string(),
                bucket: "solar".to_string(),
                token: None,
            },
            WriterConfig {
                batch_size: 10,
                flush_interval_secs: 60,
                max_retries,
                backoff_base_ms: 1,
                spill_path: None,
            },
            spill,
            StatsTracker::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_line_protocol_encoding() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let line = encode_point(&point_at(ts, 4820.5));
        assert_eq!(
            line,
            format!(
                "ac_power,device=inv-1,source=modbus,unit=W value=4820.5 {}",
                ts.timestamp_nanos_opt().unwrap()
            )
        );
    }

    #[test]
    fn test_line_protocol_escaping() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let mut point = point_at(ts, 1.0);
        point.measurement = "ac power".to_string();
        point.device_id = "inv,1=a".to_string();
        let line = encode_point(&point);
        assert!(line.starts_with("ac\\ power,device=inv\\,1\\=a,"));
    }

    #[test]
    fn test_empty_unit_tag_is_omitted() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let mut point = point_at(ts, 1.0);
        point.unit = String::new();
        assert!(!encode_point(&point).contains("unit="));
    }

    #[tokio::test]
    async fn test_exhausted_retries_spill_exactly_once_and_clear_batch() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill.jsonl");
        // Port 9 on localhost: connection refused immediately.
        let writer = test_writer("http://127.0.0.1:9", 1, spill.clone());

        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        writer
            .enqueue(vec![point_at(ts, 1.0), point_at(ts + chrono::Duration::seconds(1), 2.0)])
            .await;
        writer.flush().await;

        let content = std::fs::read_to_string(&spill).unwrap();
        let spilled: Vec<MeasurementPoint> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(spilled.len(), 2);
        assert_eq!(spilled[1].value, 2.0);

        // Batch is empty afterwards: a second flush adds nothing.
        writer.flush().await;
        let again = std::fs::read_to_string(&spill).unwrap();
        assert_eq!(again.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_flagged_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = test_writer("http://127.0.0.1:9", 0, dir.path().join("spill.jsonl"));

        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        writer.enqueue(vec![point_at(ts, 1.0)]).await;
        writer
            .enqueue(vec![point_at(ts - chrono::Duration::seconds(30), 2.0)])
            .await;

        let snap = writer.stats.snapshot();
        assert_eq!(snap.writer.out_of_order, 1);

        // Both points are still in the batch.
        let pending = writer.batch.lock().await.points.len();
        assert_eq!(pending, 2);
    }

    #[tokio::test]
    async fn test_size_threshold_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill.jsonl");
        let writer = test_writer("http://127.0.0.1:9", 0, spill.clone());

        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let points: Vec<_> = (0..10)
            .map(|i| point_at(ts + chrono::Duration::seconds(i), i as f64))
            .collect();
        // batch_size is 10: this enqueue flushes (and, store being down,
        // spills) immediately without an explicit flush call.
        writer.enqueue(points).await;

        assert_eq!(writer.batch.lock().await.points.len(), 0);
        let content = std::fs::read_to_string(&spill).unwrap();
        assert_eq!(content.lines().count(), 10);
    }
}
