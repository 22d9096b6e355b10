/*!
Vendor REST API stub.

Serves canned JSON per request path and records every request with its
query parameters, so tests can assert how many real calls the quota and
cache logic allowed through.
*/

use anyhow::Result;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Json;
use axum::Router;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub query: HashMap<String, String>,
}

#[derive(Clone, Default)]
struct ApiState {
    responses: Arc<Mutex<HashMap<String, serde_json::Value>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

pub struct ApiStub {
    addr: SocketAddr,
    state: ApiState,
    handle: tokio::task::JoinHandle<()>,
}

impl ApiStub {
    pub async fn start() -> Result<Self> {
        let state = ApiState::default();
        let router = Router::new()
            .fallback(request_handler)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        tracing::debug!("api stub listening on {}", addr);
        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Serve `body` for GETs on `path`. Unknown paths return 404.
    pub fn respond(&self, path: &str, body: serde_json::Value) {
        self.state.responses.lock().insert(path.to_string(), body);
    }

    /// Number of requests that actually reached the stub.
    pub fn request_count(&self) -> usize {
        self.state.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Requests for one path, e.g. to check which months a backfill asked for.
    pub fn requests_for(&self, path: &str) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

impl Drop for ApiStub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn request_handler(State(state): State<ApiState>, uri: Uri) -> impl IntoResponse {
    let path = uri.path().to_string();
    let query: HashMap<String, String> = uri
        .query()
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect();

    state.requests.lock().push(RecordedRequest {
        path: path.clone(),
        query,
    });

    match state.responses.lock().get(&path) {
        Some(body) => (StatusCode::OK, Json(body.clone())).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_canned_json_and_counts_requests() {
        let stub = ApiStub::start().await.unwrap();
        stub.respond("/site/1/overview", serde_json::json!({"power": 42.0}));

        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .get(format!("{}/site/1/overview?api_key=k&month=2024-05", stub.url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["power"], 42.0);

        let missing = client
            .get(format!("{}/site/1/unknown", stub.url()))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        assert_eq!(stub.request_count(), 2);
        let recorded = stub.requests_for("/site/1/overview");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].query.get("month").unwrap(), "2024-05");
    }
}
