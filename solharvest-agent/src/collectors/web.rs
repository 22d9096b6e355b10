//! Authenticated web portal collector (scraped)
//!
//! Maintains a cookie session across calls and persists it to disk so a
//! process restart does not force a fresh login. A login-redirect (or a
//! login-form body) triggers exactly one re-authentication and one retry
//! of the failed request - never a retry storm.

use anyhow::{Context, Result};
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::collectors::CollectError;
use crate::config::{EndpointDescriptor, WebSourceConfig};
use crate::model::{FetchOutcome, PayloadBody, RawPayload, SourceKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionState {
    /// Cookie pairs as `name=value`, in receive order.
    cookies: Vec<String>,
}

enum PageResult {
    Ok(String),
    LoginRequired,
}

pub struct WebCollector {
    client: reqwest::Client,
    cfg: WebSourceConfig,
    password: String,
    cache: CacheStore,
    session: Mutex<SessionState>,
    session_path: PathBuf,
}

impl WebCollector {
    pub fn new(
        cfg: WebSourceConfig,
        cache: CacheStore,
        session_path: PathBuf,
    ) -> Result<Self> {
        let password = cfg
            .resolve_password()
            .context("portal password missing (validated config expected)")?;

        // Redirects are not followed: a 302 to the login page is the
        // session-expiry signature we need to observe.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("solharvest-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let session = load_session(&session_path);

        Ok(Self {
            client,
            cfg,
            password,
            cache,
            session: Mutex::new(session),
            session_path,
        })
    }

    pub async fn collect(&self, descriptor: &EndpointDescriptor) -> RawPayload {
        let key = format!("web:{}", descriptor.id);

        if let Some(mut payload) = self.cache.get(&key).await {
            payload.outcome = FetchOutcome::CacheHit;
            return payload;
        }

        match self.fetch_page(descriptor).await {
            Ok(html) => {
                let payload =
                    RawPayload::fetched(SourceKind::Web, &descriptor.id, PayloadBody::Html(html));
                if let Err(e) = self
                    .cache
                    .put(&key, payload.clone(), self.cfg.cache_ttl_secs)
                    .await
                {
                    warn!("failed to cache web payload for {}: {}", descriptor.id, e);
                }
                payload
            }
            Err(e) => {
                warn!("web fetch failed for {}: {}", descriptor.id, e);
                RawPayload::failed(SourceKind::Web, &descriptor.id, e.to_string())
            }
        }
    }

    async fn fetch_page(&self, descriptor: &EndpointDescriptor) -> Result<String, CollectError> {
        let path = descriptor.path.clone().unwrap_or_else(|| "/".to_string());
        let url = format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path);

        match self.get_with_session(&url).await? {
            PageResult::Ok(body) => Ok(body),
            PageResult::LoginRequired => {
                debug!("session stale for {}, re-authenticating once", descriptor.id);
                self.login().await?;
                match self.get_with_session(&url).await? {
                    PageResult::Ok(body) => Ok(body),
                    // Re-auth did not stick; surface as transient.
                    PageResult::LoginRequired => Err(CollectError::Auth),
                }
            }
        }
    }

    async fn get_with_session(&self, url: &str) -> Result<PageResult, CollectError> {
        let cookie_header = {
            let session = self.session.lock().await;
            session.cookies.join("; ")
        };

        let mut request = self.client.get(url);
        if !cookie_header.is_empty() {
            request = request.header(COOKIE, cookie_header);
        }
        let response = request.send().await?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if location.contains(&self.cfg.login_path) {
                return Ok(PageResult::LoginRequired);
            }
            return Err(CollectError::Other(format!(
                "unexpected redirect to {location}"
            )));
        }
        if !status.is_success() {
            return Err(CollectError::Status(status));
        }

        let body = response.text().await?;
        if looks_like_login_page(&body) {
            return Ok(PageResult::LoginRequired);
        }
        Ok(PageResult::Ok(body))
    }

    /// POST the login form and capture the session cookies. The password
    /// never reaches the logs or the session file.
    async fn login(&self) -> Result<(), CollectError> {
        let url = format!(
            "{}{}",
            self.cfg.base_url.trim_end_matches('/'),
            self.cfg.login_path
        );
        info!("authenticating to portal as {}", self.cfg.username);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("username", self.cfg.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() && !status.is_redirection() {
            return Err(CollectError::Auth);
        }

        let cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(extract_cookie_pair)
            .collect();
        if cookies.is_empty() {
            return Err(CollectError::Auth);
        }

        let mut session = self.session.lock().await;
        session.cookies = cookies;
        persist_session(&self.session_path, &session);
        Ok(())
    }
}

/// Heuristic signature of the portal login page.
fn looks_like_login_page(body: &str) -> bool {
    body.contains("name=\"password\"") || body.contains("id=\"login-form\"")
}

/// `name=value` part of a Set-Cookie header, attributes stripped.
fn extract_cookie_pair(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    if pair.contains('=') {
        Some(pair.to_string())
    } else {
        None
    }
}

fn load_session(path: &Path) -> SessionState {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("discarding unreadable session file: {}", e);
            SessionState::default()
        }),
        Err(_) => SessionState::default(),
    }
}

fn persist_session(path: &Path, session: &SessionState) {
    match serde_json::to_string(session) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("failed to persist session: {}", e);
            }
        }
        Err(e) => warn!("failed to serialize session: {}", e),
    }
}
