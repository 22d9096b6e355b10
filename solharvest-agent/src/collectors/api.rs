//! Quota-limited REST API collector
//!
//! The provider enforces a hard daily call quota. Every fetch goes through
//! the cache first; on a miss the persisted quota ledger decides whether a
//! real request may be made. At the quota boundary the collector serves
//! stale cache data when it has some, or records a planned skip - never a
//! failure.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::collectors::{http_client, CollectError};
use crate::config::{ApiSourceConfig, EndpointDescriptor};
use crate::model::{FetchOutcome, PayloadBody, RawPayload, SourceKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum cache TTL regardless of quota headroom.
const MIN_TTL_SECS: u64 = 60;

pub struct ApiCollector {
    client: reqwest::Client,
    cfg: ApiSourceConfig,
    api_key: String,
    cache: CacheStore,
    quota: QuotaLedger,
}

impl ApiCollector {
    pub fn new(cfg: ApiSourceConfig, cache: CacheStore, quota_path: PathBuf) -> Result<Self> {
        let api_key = cfg
            .resolve_api_key()
            .context("API key missing (validated config expected)")?;
        let client = http_client(CONNECT_TIMEOUT, TOTAL_TIMEOUT)
            .context("failed to build HTTP client")?;
        let quota = QuotaLedger::open(quota_path, cfg.daily_quota)?;

        Ok(Self {
            client,
            cfg,
            api_key,
            cache,
            quota,
        })
    }

    /// Live-mode collection for one endpoint.
    pub async fn collect(&self, descriptor: &EndpointDescriptor) -> RawPayload {
        self.collect_with_params(descriptor, &[], None).await
    }

    /// Collection with extra request parameters (the backfill adds the
    /// month here) and an optional TTL override for the cache entry.
    pub async fn collect_with_params(
        &self,
        descriptor: &EndpointDescriptor,
        extra_params: &[(String, String)],
        ttl_override: Option<u64>,
    ) -> RawPayload {
        let params = merged_params(descriptor, extra_params);
        let key = cache_key(&descriptor.id, &params);

        if let Some(mut payload) = self.cache.get(&key).await {
            payload.outcome = FetchOutcome::CacheHit;
            return payload;
        }

        if !self.quota.try_acquire() {
            if let Some(mut stale) = self.cache.get_stale(&key).await {
                info!(
                    "daily quota exhausted, serving stale cache for {}",
                    descriptor.id
                );
                stale.outcome = FetchOutcome::CacheStale;
                return stale;
            }
            info!("daily quota exhausted, skipping {}", descriptor.id);
            return RawPayload::quota_skipped(SourceKind::Api, &descriptor.id);
        }

        match self.fetch(descriptor, &params).await {
            Ok(body) => {
                let payload = RawPayload::fetched(SourceKind::Api, &descriptor.id, body);
                let ttl = ttl_override.unwrap_or_else(|| self.cache_ttl_secs());
                if let Err(e) = self.cache.put(&key, payload.clone(), ttl).await {
                    warn!("failed to cache API payload for {}: {}", descriptor.id, e);
                }
                payload
            }
            Err(e) => {
                warn!("API fetch failed for {}: {}", descriptor.id, e);
                RawPayload::failed(SourceKind::Api, &descriptor.id, e.to_string())
            }
        }
    }

    /// True if a fresh cache entry exists for this endpoint + params,
    /// without consuming quota. Used by the backfill resume logic.
    pub async fn is_cached(&self, descriptor: &EndpointDescriptor, extra: &[(String, String)]) -> bool {
        let params = merged_params(descriptor, extra);
        self.cache.get(&cache_key(&descriptor.id, &params)).await.is_some()
    }

    /// Cache TTL derived from the daily quota: with `n` active endpoints
    /// each refetched at most every `ttl` seconds, worst-case daily calls
    /// stay at or under the quota.
    pub fn cache_ttl_secs(&self) -> u64 {
        let endpoints = self.cfg.endpoints.iter().filter(|e| e.enabled).count().max(1) as u64;
        ttl_for_quota(self.cfg.daily_quota, endpoints)
    }

    pub fn quota_remaining(&self) -> u32 {
        self.quota.remaining()
    }

    async fn fetch(
        &self,
        descriptor: &EndpointDescriptor,
        params: &BTreeMap<String, String>,
    ) -> Result<PayloadBody, CollectError> {
        let path = descriptor
            .path
            .clone()
            .unwrap_or_else(|| format!("/site/{}/overview", self.cfg.site_id));
        let url = format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path);

        debug!("GET {} ({} params)", url, params.len());
        let response = self
            .client
            .get(&url)
            .query(&[("api_key", self.api_key.as_str())])
            .query(&params.iter().collect::<Vec<_>>())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectError::Status(status));
        }

        let json: serde_json::Value = response.json().await?;
        Ok(PayloadBody::Json(json))
    }
}

/// `86400 * endpoints / quota`, rounded up, floored at one minute.
pub fn ttl_for_quota(daily_quota: u32, active_endpoints: u64) -> u64 {
    let quota = daily_quota.max(1) as u64;
    let ttl = (86_400 * active_endpoints).div_ceil(quota);
    ttl.max(MIN_TTL_SECS)
}

fn merged_params(
    descriptor: &EndpointDescriptor,
    extra: &[(String, String)],
) -> BTreeMap<String, String> {
    let mut params: BTreeMap<String, String> = descriptor
        .request_params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in extra {
        params.insert(k.clone(), v.clone());
    }
    params
}

/// Deterministic cache key: endpoint id plus sorted request parameters.
fn cache_key(endpoint_id: &str, params: &BTreeMap<String, String>) -> String {
    let mut key = format!("api:{endpoint_id}");
    for (k, v) in params {
        key.push_str(&format!(":{k}={v}"));
    }
    key
}

// ===== Quota ledger =====

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuotaState {
    day: NaiveDate,
    calls: u32,
}

/// Calls made in the current UTC-day quota window, persisted so a restart
/// cannot silently double the daily budget.
pub struct QuotaLedger {
    path: PathBuf,
    limit: u32,
    state: parking_lot::Mutex<QuotaState>,
}

impl QuotaLedger {
    pub fn open(path: impl AsRef<Path>, limit: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("discarding unreadable quota ledger: {}", e);
                QuotaState {
                    day: chrono::Utc::now().date_naive(),
                    calls: 0,
                }
            }),
            Err(_) => QuotaState {
                day: chrono::Utc::now().date_naive(),
                calls: 0,
            },
        };

        Ok(Self {
            path,
            limit,
            state: parking_lot::Mutex::new(state),
        })
    }

    /// Reserve one call from today's budget. Returns false once the quota
    /// window is exhausted; the window resets on UTC day rollover.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_on(chrono::Utc::now().date_naive())
    }

    fn try_acquire_on(&self, today: NaiveDate) -> bool {
        let mut state = self.state.lock();
        if state.day != today {
            state.day = today;
            state.calls = 0;
        }
        if state.calls >= self.limit {
            return false;
        }
        state.calls += 1;
        let snapshot = state.clone();
        drop(state);
        self.persist(&snapshot);
        true
    }

    pub fn remaining(&self) -> u32 {
        let state = self.state.lock();
        if state.day != chrono::Utc::now().date_naive() {
            return self.limit;
        }
        self.limit.saturating_sub(state.calls)
    }

    fn persist(&self, state: &QuotaState) {
        match serde_json::to_string(state) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&self.path, content) {
                    warn!("failed to persist quota ledger: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize quota ledger: {}", e),
        }
    }

    #[cfg(test)]
    fn set_calls(&self, day: NaiveDate, calls: u32) {
        let mut state = self.state.lock();
        state.day = day;
        state.calls = calls;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_keeps_daily_calls_under_quota() {
        // 1 endpoint, 300 calls/day: refetch at most every 288s.
        assert_eq!(ttl_for_quota(300, 1), 288);
        // 4 endpoints share the same budget.
        assert_eq!(ttl_for_quota(300, 4), 1152);
        // Generous quota still floors at one minute.
        assert_eq!(ttl_for_quota(100_000, 1), 60);
    }

    #[test]
    fn test_cache_key_is_sorted_and_stable() {
        let mut params = BTreeMap::new();
        params.insert("month".to_string(), "2024-05".to_string());
        params.insert("granularity".to_string(), "day".to_string());
        assert_eq!(
            cache_key("site-energy", &params),
            "api:site-energy:granularity=day:month=2024-05"
        );
    }

    #[test]
    fn test_quota_boundary_last_call_proceeds_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = QuotaLedger::open(dir.path().join("quota.json"), 300).unwrap();
        let today = chrono::Utc::now().date_naive();

        // 290 calls already made this window.
        ledger.set_calls(today, 290);
        for _ in 0..10 {
            assert!(ledger.try_acquire_on(today));
        }
        // Call 301 is refused.
        assert!(!ledger.try_acquire_on(today));
        assert_eq!(ledger.remaining(), 0);
    }

    #[test]
    fn test_quota_resets_on_day_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = QuotaLedger::open(dir.path().join("quota.json"), 2).unwrap();
        let day1 = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

        assert!(ledger.try_acquire_on(day1));
        assert!(ledger.try_acquire_on(day1));
        assert!(!ledger.try_acquire_on(day1));
        assert!(ledger.try_acquire_on(day2));
    }

    #[test]
    fn test_quota_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let today = chrono::Utc::now().date_naive();

        {
            let ledger = QuotaLedger::open(&path, 5).unwrap();
            assert!(ledger.try_acquire_on(today));
            assert!(ledger.try_acquire_on(today));
        }

        let reopened = QuotaLedger::open(&path, 5).unwrap();
        assert_eq!(reopened.remaining(), 3);
    }
}
