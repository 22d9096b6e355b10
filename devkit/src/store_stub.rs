/*!
In-process time-series store speaking just enough of the InfluxDB v2
write API for the agent's writer.

Records every line-protocol line it receives and can be told to fail the
next N writes, for retry and spill testing.
*/

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone, Default)]
struct StoreState {
    lines: Arc<Mutex<Vec<String>>>,
    fail_remaining: Arc<Mutex<u32>>,
    auth_headers: Arc<Mutex<Vec<String>>>,
}

pub struct StoreStub {
    addr: SocketAddr,
    state: StoreState,
    handle: tokio::task::JoinHandle<()>,
}

impl StoreStub {
    /// Bind an ephemeral port and start serving.
    pub async fn start() -> Result<Self> {
        let state = StoreState::default();
        let router = Router::new()
            .route("/api/v2/write", post(write_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        tracing::debug!("store stub listening on {}", addr);
        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Fail the next `n` write requests with 503.
    pub fn fail_next(&self, n: u32) {
        *self.state.fail_remaining.lock() = n;
    }

    /// All recorded line-protocol lines, in arrival order.
    pub fn lines(&self) -> Vec<String> {
        self.state.lines.lock().clone()
    }

    pub fn line_count(&self) -> usize {
        self.state.lines.lock().len()
    }

    /// Lines whose measurement matches `name`.
    pub fn lines_for(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name},");
        self.state
            .lines
            .lock()
            .iter()
            .filter(|l| l.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Authorization header values seen so far.
    pub fn auth_headers(&self) -> Vec<String> {
        self.state.auth_headers.lock().clone()
    }

    pub fn clear(&self) {
        self.state.lines.lock().clear();
    }
}

impl Drop for StoreStub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn write_handler(
    State(state): State<StoreState>,
    headers: axum::http::HeaderMap,
    body: String,
) -> StatusCode {
    {
        let mut fail = state.fail_remaining.lock();
        if *fail > 0 {
            *fail -= 1;
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }

    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.auth_headers.lock().push(auth.to_string());
    }

    let mut lines = state.lines.lock();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        lines.push(line.to_string());
    }
    StatusCode::NO_CONTENT
}
