//! In-process transport and store doubles for client tests.
//!
//! Concurrency tests need deterministic interleaving, which a scripted
//! transport gives and a local HTTP server doesn't.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use super::client::AuthenticatedHttpClient;
use super::request::ApiRequest;
use super::transport::{Transport, TransportResponse};
use crate::config::{Config, REFRESH_PATH, REQUEST_TIMEOUT};
use crate::session::{MemorySessionStore, SessionStore};
use crate::{Error, Result};

type Route = (Method, String);

/// Transport answering from a script.
///
/// While the session is expired every route answers 401. `POST /auth/refresh`
/// renews it (after `refresh_delay`) unless the script says refreshes fail.
/// Unscripted routes answer `{"data": {"path": <path>}}`.
#[derive(Debug)]
pub(crate) struct ScriptedTransport {
    authenticated: AtomicBool,
    refresh_succeeds: bool,
    refresh_delay: Duration,
    offline: bool,
    reject_after_refresh: HashSet<Route>,
    replies: HashMap<Route, TransportResponse>,
    delays: HashMap<Route, Duration>,
    refresh_calls: AtomicUsize,
    log: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self {
            authenticated: AtomicBool::new(true),
            refresh_succeeds: true,
            refresh_delay: Duration::ZERO,
            offline: false,
            reject_after_refresh: HashSet::new(),
            replies: HashMap::new(),
            delays: HashMap::new(),
            refresh_calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Start with an expired session.
    pub(crate) fn expired(self) -> Self {
        self.authenticated.store(false, Ordering::SeqCst);
        self
    }

    pub(crate) fn refresh_fails(mut self) -> Self {
        self.refresh_succeeds = false;
        self
    }

    pub(crate) fn refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    /// Every call times out.
    pub(crate) fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// Keep answering 401 on this route even with a renewed session.
    pub(crate) fn reject_after_refresh(mut self, method: Method, path: &str) -> Self {
        self.reject_after_refresh.insert((method, path.to_string()));
        self
    }

    /// Answer this route late. The answer reflects the session as it was
    /// when the request was sent.
    pub(crate) fn delay(mut self, method: Method, path: &str, delay: Duration) -> Self {
        self.delays.insert((method, path.to_string()), delay);
        self
    }

    pub(crate) fn reply(self, method: Method, path: &str, status: StatusCode, body: Value) -> Self {
        self.reply_with(method, path, TransportResponse::json(status, &body))
    }

    pub(crate) fn reply_raw(self, method: Method, path: &str, status: StatusCode, body: &str) -> Self {
        self.reply_with(method, path, TransportResponse::new(status, body))
    }

    fn reply_with(mut self, method: Method, path: &str, response: TransportResponse) -> Self {
        self.replies.insert((method, path.to_string()), response);
        self
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.lock_log().len()
    }

    pub(crate) fn calls(&self, method: Method, path: &str) -> usize {
        self.lock_log()
            .iter()
            .filter(|request| request.method == method && request.path == path)
            .count()
    }

    pub(crate) fn last_request(&self, method: Method, path: &str) -> Option<ApiRequest> {
        self.lock_log()
            .iter()
            .rev()
            .find(|request| request.method == method && request.path == path)
            .cloned()
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, Vec<ApiRequest>> {
        self.log.lock().unwrap()
    }

    async fn refresh(&self) -> TransportResponse {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }

        if self.refresh_succeeds {
            self.authenticated.store(true, Ordering::SeqCst);
            TransportResponse::json(StatusCode::OK, &json!({ "success": true }))
        } else {
            TransportResponse::json(
                StatusCode::UNAUTHORIZED,
                &json!({ "detail": "Refresh token expired" }),
            )
        }
    }

    fn answer(&self, request: &ApiRequest) -> TransportResponse {
        let route = (request.method.clone(), request.path.clone());
        let unauthorized = TransportResponse::json(
            StatusCode::UNAUTHORIZED,
            &json!({ "detail": "Not authenticated" }),
        );

        if !self.authenticated.load(Ordering::SeqCst) || self.reject_after_refresh.contains(&route) {
            return unauthorized;
        }
        match self.replies.get(&route) {
            Some(response) => response.clone(),
            None => TransportResponse::json(
                StatusCode::OK,
                &json!({ "data": { "path": request.path } }),
            ),
        }
    }
}

impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<TransportResponse> {
        self.lock_log().push(request.clone());

        if self.offline {
            return Err(Error::Timeout(REQUEST_TIMEOUT));
        }
        if request.method == Method::POST && request.path == REFRESH_PATH {
            return Ok(self.refresh().await);
        }
        let response = self.answer(request);
        let route = (request.method.clone(), request.path.clone());
        if let Some(delay) = self.delays.get(&route) {
            tokio::time::sleep(*delay).await;
        }
        Ok(response)
    }
}

/// Client over a scripted transport with the default configuration.
pub(crate) fn client_with(transport: ScriptedTransport) -> AuthenticatedHttpClient<ScriptedTransport> {
    AuthenticatedHttpClient::with_transport(
        Config::default(),
        transport,
        Arc::new(MemorySessionStore::new()),
    )
}

/// Memory store that counts removals per key.
#[derive(Debug, Default)]
pub(crate) struct CountingStore {
    inner: MemorySessionStore,
    removals: Mutex<HashMap<String, usize>>,
}

impl CountingStore {
    pub(crate) fn removals(&self, key: &str) -> usize {
        self.removals.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

impl SessionStore for CountingStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        *self.removals.lock().unwrap().entry(key.to_string()).or_default() += 1;
        self.inner.remove(key)
    }
}
