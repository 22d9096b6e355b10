//! Core data model shared by all pipeline stages
//!
//! - RawPayload: one collection attempt, tagged by source and outcome
//! - PayloadBody: JSON tree, HTML document or register map
//! - MeasurementPoint: the canonical unit handed to the writer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The three telemetry source families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Web,
    Modbus,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Api => write!(f, "api"),
            SourceKind::Web => write!(f, "web"),
            SourceKind::Modbus => write!(f, "modbus"),
        }
    }
}

/// The unparsed body of one collection attempt.
///
/// Each collector produces exactly one shape; the normalizer dispatches on
/// the variant instead of inspecting the content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PayloadBody {
    /// Parsed JSON tree from the REST API.
    Json(serde_json::Value),
    /// Raw HTML document from the web portal.
    Html(String),
    /// Register values already converted to engineering units, keyed by
    /// measurement name.
    Registers(HashMap<String, f64>),
}

/// How a collection attempt ended.
///
/// Quota skips and cache hits are not failures and are counted separately
/// by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FetchOutcome {
    /// Fresh data fetched from the remote source.
    Fetched,
    /// Served from the cache within its TTL, no network call made.
    CacheHit,
    /// Quota exhausted; an expired cache entry was served instead.
    CacheStale,
    /// Quota exhausted and no cached data available.
    QuotaSkipped,
    /// The remote call failed (timeout, refused, bad status, bad body).
    Failed(String),
}

/// Result of one collection attempt, owned by the collector until handed
/// to the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
    pub source_kind: SourceKind,
    pub endpoint_id: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Option<PayloadBody>,
    pub outcome: FetchOutcome,
}

impl RawPayload {
    /// A successful fetch with a fresh body.
    pub fn fetched(source_kind: SourceKind, endpoint_id: &str, body: PayloadBody) -> Self {
        Self {
            source_kind,
            endpoint_id: endpoint_id.to_string(),
            fetched_at: Utc::now(),
            body: Some(body),
            outcome: FetchOutcome::Fetched,
        }
    }

    /// A failed attempt. Collectors return this instead of raising.
    pub fn failed(source_kind: SourceKind, endpoint_id: &str, detail: impl Into<String>) -> Self {
        Self {
            source_kind,
            endpoint_id: endpoint_id.to_string(),
            fetched_at: Utc::now(),
            body: None,
            outcome: FetchOutcome::Failed(detail.into()),
        }
    }

    /// A planned quota skip with nothing cached to fall back on.
    pub fn quota_skipped(source_kind: SourceKind, endpoint_id: &str) -> Self {
        Self {
            source_kind,
            endpoint_id: endpoint_id.to_string(),
            fetched_at: Utc::now(),
            body: None,
            outcome: FetchOutcome::QuotaSkipped,
        }
    }

    /// True when the payload carries a usable body.
    pub fn is_success(&self) -> bool {
        self.body.is_some()
            && matches!(
                self.outcome,
                FetchOutcome::Fetched | FetchOutcome::CacheHit | FetchOutcome::CacheStale
            )
    }

    /// Error detail for failed attempts.
    pub fn error_detail(&self) -> Option<&str> {
        match &self.outcome {
            FetchOutcome::Failed(detail) => Some(detail),
            _ => None,
        }
    }
}

/// Canonical measurement point, as written to the time-series store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPoint {
    pub measurement: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
    pub source_kind: SourceKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_payload_is_not_success() {
        let p = RawPayload::failed(SourceKind::Modbus, "inverter", "connection refused");
        assert!(!p.is_success());
        assert_eq!(p.error_detail(), Some("connection refused"));
        assert!(p.body.is_none());
    }

    #[test]
    fn test_fetched_payload_is_success() {
        let p = RawPayload::fetched(
            SourceKind::Api,
            "site-energy",
            PayloadBody::Json(serde_json::json!({"value": 1.0})),
        );
        assert!(p.is_success());
        assert_eq!(p.outcome, FetchOutcome::Fetched);
    }

    #[test]
    fn test_quota_skip_is_distinct_from_failure() {
        let p = RawPayload::quota_skipped(SourceKind::Api, "site-energy");
        assert!(!p.is_success());
        assert_eq!(p.outcome, FetchOutcome::QuotaSkipped);
        assert!(p.error_detail().is_none());
    }
}
