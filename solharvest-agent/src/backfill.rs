//! One-shot historical backfill over the REST API
//!
//! Walks month by month from the configured history start to the current
//! month, fetching each month's data through the same quota-aware
//! collector the live loop uses. Completed months are immutable, so they
//! are cached with a long TTL; a rerun resumes where the quota cut the
//! previous run short instead of refetching.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::collectors::ApiCollector;
use crate::config::ApiSourceConfig;
use crate::filter;
use crate::model::{FetchOutcome, SourceKind};
use crate::normalize;
use crate::stats::StatsTracker;
use crate::writer::TimeSeriesWriter;

/// Completed months never change; keep them cached for a year so reruns
/// cost no quota.
const PAST_MONTH_TTL_SECS: u64 = 365 * 86_400;

#[derive(Debug, Default)]
pub struct BackfillSummary {
    pub months_total: usize,
    pub fetched: u64,
    pub already_cached: u64,
    pub failed: u64,
    pub points_enqueued: u64,
    /// True when the daily quota ran out before the walk finished.
    pub quota_exhausted: bool,
}

pub async fn run(
    cfg: &ApiSourceConfig,
    collector: &ApiCollector,
    writer: &TimeSeriesWriter,
    stats: &StatsTracker,
    shutdown: &watch::Receiver<bool>,
) -> Result<BackfillSummary> {
    let start = cfg
        .history_start
        .context("api.history_start is required for a backfill run")?;
    let today = Utc::now().date_naive();
    let months = month_range(start, today);

    let mut summary = BackfillSummary {
        months_total: months.len(),
        ..Default::default()
    };
    info!(
        "backfilling {} months ({} .. {}), quota remaining {}",
        months.len(),
        months.first().map(String::as_str).unwrap_or("-"),
        months.last().map(String::as_str).unwrap_or("-"),
        collector.quota_remaining()
    );

    'months: for month in &months {
        if *shutdown.borrow() {
            info!("backfill interrupted at {}, progress is cached", month);
            break;
        }
        // The running month still accrues data; only completed months get
        // the immutable TTL.
        let is_current = *month == month_key(today);
        let params = [("month".to_string(), month.clone())];
        let ttl = (!is_current).then_some(PAST_MONTH_TTL_SECS);

        for descriptor in cfg.endpoints.iter().filter(|d| d.enabled) {
            if collector.is_cached(descriptor, &params).await {
                summary.already_cached += 1;
                continue;
            }

            let payload = collector.collect_with_params(descriptor, &params, ttl).await;
            stats.record_outcome(SourceKind::Api, &payload.outcome);
            match &payload.outcome {
                FetchOutcome::QuotaSkipped | FetchOutcome::CacheStale => {
                    info!("daily quota exhausted at {}, rerun tomorrow to resume", month);
                    summary.quota_exhausted = true;
                    break 'months;
                }
                FetchOutcome::Failed(detail) => {
                    warn!("backfill fetch failed for {} {}: {}", descriptor.id, month, detail);
                    summary.failed += 1;
                    continue;
                }
                FetchOutcome::Fetched | FetchOutcome::CacheHit => summary.fetched += 1,
            }

            let points = normalize::normalize(descriptor, &payload);
            let report = filter::filter(descriptor, points);
            summary.points_enqueued += report.kept.len() as u64;
            stats.record_points(SourceKind::Api, report.kept.len() as u64, report.dropped());
            writer.enqueue(report.kept).await;
        }
    }

    writer.flush().await;
    info!(
        "backfill done: {}/{} months fetched, {} cached, {} failed, {} points",
        summary.fetched,
        summary.months_total,
        summary.already_cached,
        summary.failed,
        summary.points_enqueued
    );
    Ok(summary)
}

/// `YYYY-MM` keys for every month from `start` through `end`, inclusive.
pub fn month_range(start: NaiveDate, end: NaiveDate) -> Vec<String> {
    let mut months = Vec::new();
    let (mut year, mut month) = (start.year(), start.month());
    let (end_year, end_month) = (end.year(), end.month());

    while (year, month) <= (end_year, end_month) {
        months.push(format!("{year:04}-{month:02}"));
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
    }
    months
}

fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_month_range_spans_year_boundary() {
        let months = month_range(date(2023, 11, 15), date(2024, 2, 3));
        assert_eq!(months, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);
    }

    #[test]
    fn test_month_range_single_month() {
        assert_eq!(month_range(date(2024, 5, 1), date(2024, 5, 31)), vec!["2024-05"]);
    }

    #[test]
    fn test_month_range_start_after_end_is_empty() {
        assert!(month_range(date(2024, 6, 1), date(2024, 5, 31)).is_empty());
    }
}
