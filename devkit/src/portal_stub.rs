/*!
Web portal stub with cookie-based login.

Pages are served only with a valid session cookie; everything else is a
302 to `/login`. Sessions can be expired on demand to exercise the
agent's re-authentication path, and logins are counted so tests can
assert "exactly one re-auth".
*/

use anyhow::Result;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const LOGIN_PAGE: &str = r#"<html><body><form id="login-form" method="post" action="/login">
<input name="username"><input type="password" name="password">
</form></body></html>"#;

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

#[derive(Clone)]
struct PortalState {
    username: String,
    password: String,
    pages: Arc<Mutex<HashMap<String, String>>>,
    sessions: Arc<Mutex<HashSet<String>>>,
    login_count: Arc<AtomicU32>,
}

pub struct PortalStub {
    addr: SocketAddr,
    state: PortalState,
    handle: tokio::task::JoinHandle<()>,
}

impl PortalStub {
    pub async fn start(username: &str, password: &str) -> Result<Self> {
        let state = PortalState {
            username: username.to_string(),
            password: password.to_string(),
            pages: Arc::new(Mutex::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(HashSet::new())),
            login_count: Arc::new(AtomicU32::new(0)),
        };
        let router = Router::new()
            .route("/login", post(login_handler).get(login_page))
            .fallback(page_handler)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        tracing::debug!("portal stub listening on {}", addr);
        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Serve `html` for authenticated GETs on `path`.
    pub fn set_page(&self, path: &str, html: &str) {
        self.state
            .pages
            .lock()
            .insert(path.to_string(), html.to_string());
    }

    /// Invalidate every session; the next page request redirects to login.
    pub fn expire_sessions(&self) {
        self.state.sessions.lock().clear();
    }

    /// Successful logins so far.
    pub fn login_count(&self) -> u32 {
        self.state.login_count.load(Ordering::Relaxed)
    }
}

impl Drop for PortalStub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn login_page() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

async fn login_handler(State(state): State<PortalState>, Form(form): Form<LoginForm>) -> Response {
    if form.username != state.username || form.password != state.password {
        return (StatusCode::UNAUTHORIZED, Html(LOGIN_PAGE)).into_response();
    }

    let n = state.login_count.fetch_add(1, Ordering::Relaxed) + 1;
    let token = format!("sess-{n}");
    state.sessions.lock().insert(token.clone());

    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, "/")
        .header(
            header::SET_COOKIE,
            format!("PORTAL_SESSION={token}; Path=/; HttpOnly"),
        )
        .body(Body::empty())
        .unwrap()
}

async fn page_handler(State(state): State<PortalState>, headers: HeaderMap, uri: Uri) -> Response {
    if !has_valid_session(&state, &headers) {
        return Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, "/login")
            .body(Body::empty())
            .unwrap();
    }

    match state.pages.lock().get(uri.path()) {
        Some(html) => Html(html.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn has_valid_session(state: &PortalState, headers: &HeaderMap) -> bool {
    let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let sessions = state.sessions.lock();
    cookies.split(';').any(|pair| {
        pair.trim()
            .strip_prefix("PORTAL_SESSION=")
            .is_some_and(|token| sessions.contains(token))
    })
}
