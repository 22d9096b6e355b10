//! Source collectors
//!
//! Three independent collectors share one contract: `collect(descriptor)`
//! returns a `RawPayload` and never raises on remote failure. Only broken
//! configuration is an error at construction time.

pub mod api;
pub mod realtime;
pub mod web;

pub use api::ApiCollector;
pub use realtime::RealtimeCollector;
pub use web::WebCollector;

use std::time::Duration;

/// Failure modes of a single collection attempt. Collectors fold these
/// into `FetchOutcome::Failed` details instead of propagating them.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("authentication failed")]
    Auth,
    #[error("modbus: {0}")]
    Modbus(String),
    #[error("{0}")]
    Other(String),
}

/// Shared HTTP client builder. Connect and total timeouts are mandatory so
/// a hung remote endpoint cannot starve a loop.
pub(crate) fn http_client(
    connect_timeout: Duration,
    total_timeout: Duration,
) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(total_timeout)
        .user_agent(concat!("solharvest-agent/", env!("CARGO_PKG_VERSION")))
        .build()
}
