//! Authenticated HTTP client implementation with session refresh

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::cookies::PersistentCookies;
use super::refresh::RefreshCoordinator;
use super::request::{ApiRequest, FilePart, RequestBody, RequestOptions};
use super::transport::{ReqwestTransport, Transport, TransportResponse};
use crate::config::{Config, HEALTH_PATH, REFRESH_PATH};
use crate::events::{AuthEvent, EVENT_CHANNEL_CAPACITY};
use crate::session::{
    FileSessionStore, MemorySessionStore, SessionStore, EXPIRED_SESSION_KEYS,
};
use crate::types::{unwrap_envelope, ErrorBody, HealthStatus};
use crate::{Error, Result};

/// Client over the production `reqwest` transport.
pub type ApiClient = AuthenticatedHttpClient<ReqwestTransport>;

/// HTTP client for the Tradedesk backend.
///
/// Every call goes to `{backend_url}/api/v1{path}` with the session cookies the
/// transport holds. A request rejected with 401 triggers one session refresh
/// (shared with any other request rejected meanwhile) and is replayed once.
pub struct AuthenticatedHttpClient<T = ReqwestTransport> {
    config: Config,
    transport: T,
    store: Arc<dyn SessionStore>,
    refresh: RefreshCoordinator,
    events: broadcast::Sender<AuthEvent>,
}

impl ApiClient {
    /// Create a client from configuration.
    ///
    /// With a session file, session slots and cookies are kept in a
    /// [`FileSessionStore`] so a later process picks the session up again.
    /// Without one, both live in memory.
    pub fn from_config(config: Config) -> Result<Self> {
        let (transport, store) = match &config.session_file {
            Some(path) => {
                let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::open(path)?);
                let cookies = Arc::new(PersistentCookies::load(store.clone()));
                let transport = ReqwestTransport::with_cookie_provider(config.timeout, cookies)?;
                (transport, store)
            }
            None => {
                let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
                (ReqwestTransport::new(config.timeout)?, store)
            }
        };
        Ok(Self::with_transport(config, transport, store))
    }
}

impl<T: Transport> AuthenticatedHttpClient<T> {
    /// Create a client over any transport and session store.
    pub fn with_transport(config: Config, transport: T, store: Arc<dyn SessionStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            transport,
            store,
            refresh: RefreshCoordinator::new(),
            events,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Whether a session refresh is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.refresh.is_refreshing()
    }

    /// Number of session refreshes started by this client.
    pub fn refresh_count(&self) -> u64 {
        self.refresh.episodes()
    }

    // ========================================================================
    // Request API
    // ========================================================================

    /// Make a GET request
    pub async fn get<R: DeserializeOwned>(
        &self,
        path: &str,
        options: Option<RequestOptions>,
    ) -> Result<R> {
        self.request(Method::GET, path, RequestBody::Empty, options)
            .await
    }

    /// Make a POST request
    pub async fn post<R, B>(
        &self,
        path: &str,
        body: Option<&B>,
        options: Option<RequestOptions>,
    ) -> Result<R>
    where
        R: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(body)?;
        self.request(Method::POST, path, body, options).await
    }

    /// Make a PUT request
    pub async fn put<R, B>(
        &self,
        path: &str,
        body: Option<&B>,
        options: Option<RequestOptions>,
    ) -> Result<R>
    where
        R: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(body)?;
        self.request(Method::PUT, path, body, options).await
    }

    /// Make a PATCH request
    pub async fn patch<R, B>(
        &self,
        path: &str,
        body: Option<&B>,
        options: Option<RequestOptions>,
    ) -> Result<R>
    where
        R: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(body)?;
        self.request(Method::PATCH, path, body, options).await
    }

    /// Make a DELETE request
    pub async fn delete<R: DeserializeOwned>(
        &self,
        path: &str,
        options: Option<RequestOptions>,
    ) -> Result<R> {
        self.request(Method::DELETE, path, RequestBody::Empty, options)
            .await
    }

    /// Upload a file as `multipart/form-data` under the `file` field.
    ///
    /// Caller headers are kept, except `Content-Type`: the multipart boundary
    /// has to be set by the transport.
    pub async fn upload<R: DeserializeOwned>(
        &self,
        path: &str,
        file: FilePart,
        options: Option<RequestOptions>,
    ) -> Result<R> {
        let options = options.unwrap_or_default().without_content_type();
        self.request(Method::POST, path, RequestBody::Multipart(file), Some(options))
            .await
    }

    // ========================================================================
    // Health API
    // ========================================================================

    /// Check if the backend is healthy. Never fails; any error means unhealthy.
    pub async fn health_check(&self) -> bool {
        let request = ApiRequest::new(
            Method::GET,
            self.config.health_url(),
            HEALTH_PATH,
            RequestBody::Empty,
            RequestOptions::default(),
        );

        match self.transport.send(&request).await {
            Ok(response) if response.status.is_success() => {
                serde_json::from_slice::<HealthStatus>(&response.body)
                    .map(|health| health.status == "healthy")
                    .unwrap_or(false)
            }
            Ok(response) => {
                tracing::debug!("Health check returned {}", response.status);
                false
            }
            Err(e) => {
                tracing::debug!("Health check failed: {}", e);
                false
            }
        }
    }

    // ========================================================================
    // Session Refresh
    // ========================================================================

    /// Renew the session, or wait for the renewal already in flight.
    ///
    /// On failure the cached user and session slots are cleared and
    /// [`AuthEvent::SessionExpired`] is broadcast, once per failed episode.
    pub async fn refresh_session(&self) -> Result<()> {
        self.refresh.run(|| self.perform_refresh()).await
    }

    async fn perform_refresh(&self) -> Result<()> {
        tracing::info!("Refreshing session");
        let request = self.build_request(
            Method::POST,
            REFRESH_PATH,
            RequestBody::Empty,
            None,
        )?;

        let outcome = match self.dispatch(&request).await {
            Ok(response) if response.status.is_success() => Ok(()),
            Ok(response) => Err(status_error(response)),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) => {
                tracing::info!("Session refreshed");
                let _ = self.events.send(AuthEvent::Refreshed);
            }
            Err(e) => {
                tracing::warn!("Session refresh failed: {}", e);
                self.expire_session();
            }
        }
        outcome
    }

    fn expire_session(&self) {
        for key in EXPIRED_SESSION_KEYS {
            if let Err(e) = self.store.remove(key) {
                tracing::warn!("Failed to clear session slot {}: {}", key, e);
            }
        }
        let _ = self.events.send(AuthEvent::SessionExpired {
            login_route: self.config.login_route.clone(),
        });
    }

    // ========================================================================
    // Internal HTTP Methods
    // ========================================================================

    async fn request<R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        options: Option<RequestOptions>,
    ) -> Result<R> {
        let request = self.build_request(method, path, body, options)?;
        let response = self.execute(request).await?;
        decode(&response.body)
    }

    fn build_request(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        options: Option<RequestOptions>,
    ) -> Result<ApiRequest> {
        if path.trim().is_empty() {
            return Err(Error::InvalidPath(path.to_string()));
        }
        Ok(ApiRequest::new(
            method,
            self.config.api_url(path),
            path,
            body,
            options.unwrap_or_default(),
        ))
    }

    /// Send a request, renewing the session and replaying once on 401.
    async fn execute(&self, mut request: ApiRequest) -> Result<TransportResponse> {
        let generation = self.refresh.generation();
        let response = self.dispatch(&request).await?;
        if response.status != StatusCode::UNAUTHORIZED || !self.may_refresh(&request) {
            return check_status(&request, response);
        }

        request.retried = true;
        if self.refresh.generation() == generation {
            tracing::debug!(
                request_id = %request.id,
                "{} {} rejected with 401, renewing session",
                request.method,
                request.path
            );
            self.refresh_session().await?;
        } else {
            // Sent before a refresh that has since succeeded
            tracing::debug!(
                request_id = %request.id,
                "{} {} rejected with stale session, replaying",
                request.method,
                request.path
            );
        }

        let response = self.dispatch(&request).await?;
        check_status(&request, response)
    }

    fn may_refresh(&self, request: &ApiRequest) -> bool {
        !request.retried && !request.options.skip_auth_refresh && request.path != REFRESH_PATH
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<TransportResponse> {
        tracing::debug!(
            request_id = %request.id,
            retry = request.retried,
            "{} {}",
            request.method,
            request.url
        );

        match self.transport.send(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    "{} {} failed: {}",
                    request.method,
                    request.path,
                    e
                );
                Err(e)
            }
        }
    }
}

fn json_body<B: Serialize + ?Sized>(body: Option<&B>) -> Result<RequestBody> {
    match body {
        Some(body) => Ok(RequestBody::Json(serde_json::to_value(body)?)),
        None => Ok(RequestBody::Empty),
    }
}

fn check_status(request: &ApiRequest, response: TransportResponse) -> Result<TransportResponse> {
    if response.status.is_success() {
        return Ok(response);
    }

    // 401s have their own path and are reported by the refresh flow
    if response.status != StatusCode::UNAUTHORIZED {
        tracing::warn!(
            request_id = %request.id,
            "{} {} returned {}: {}",
            request.method,
            request.path,
            response.status,
            response.text()
        );
    }
    Err(status_error(response))
}

fn status_error(response: TransportResponse) -> Error {
    let details = ErrorBody::parse(&response.body);
    Error::Status {
        status: response.status,
        message: details.summary(),
        error_code: details.error_code,
        body: response.text(),
    }
}

/// Decode a success body: envelope `data` if present, raw body otherwise.
fn decode<R: DeserializeOwned>(body: &[u8]) -> Result<R> {
    let value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
    };
    Ok(serde_json::from_value(unwrap_envelope(value))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{client_with, CountingStore, ScriptedTransport};
    use crate::session::{SESSION_KEY, USER_KEY};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_get_unwraps_envelope() {
        let transport = ScriptedTransport::new().reply(
            Method::GET,
            "/account",
            StatusCode::OK,
            json!({ "data": { "balance": 1250.5 }, "success": true }),
        );
        let client = client_with(transport);

        let account: Value = client.get("/account", None).await.unwrap();
        assert_eq!(account, json!({ "balance": 1250.5 }));
    }

    #[tokio::test]
    async fn test_raw_body_returned_unchanged() {
        let raw = json!({ "balance": 1250.5, "currency": "USD" });
        let transport =
            ScriptedTransport::new().reply(Method::GET, "/account", StatusCode::OK, raw.clone());
        let client = client_with(transport);

        let account: Value = client.get("/account", None).await.unwrap();
        assert_eq!(account, raw);
    }

    #[tokio::test]
    async fn test_all_verbs_unwrap_envelope() {
        let transport = ScriptedTransport::new()
            .reply(Method::POST, "/bots", StatusCode::CREATED, json!({ "data": { "id": 1 } }))
            .reply(Method::PUT, "/bots/1", StatusCode::OK, json!({ "data": { "id": 1, "name": "grid" } }))
            .reply(Method::PATCH, "/bots/1", StatusCode::OK, json!({ "data": { "active": true } }))
            .reply(Method::DELETE, "/bots/1", StatusCode::OK, json!({ "data": { "deleted": true } }));
        let client = client_with(transport);

        let body = json!({ "name": "grid" });
        let created: Value = client.post("/bots", Some(&body), None).await.unwrap();
        let updated: Value = client.put("/bots/1", Some(&body), None).await.unwrap();
        let patched: Value = client.patch("/bots/1", Some(&json!({ "active": true })), None).await.unwrap();
        let deleted: Value = client.delete("/bots/1", None).await.unwrap();

        assert_eq!(created, json!({ "id": 1 }));
        assert_eq!(updated, json!({ "id": 1, "name": "grid" }));
        assert_eq!(patched, json!({ "active": true }));
        assert_eq!(deleted, json!({ "deleted": true }));

        let sent = client.transport().last_request(Method::POST, "/bots").unwrap();
        assert_eq!(sent.body, RequestBody::Json(json!({ "name": "grid" })));
        assert_eq!(sent.url, "http://localhost:8000/api/v1/bots");
    }

    #[tokio::test]
    async fn test_empty_body_decodes_to_unit() {
        let transport = ScriptedTransport::new().reply_raw(
            Method::DELETE,
            "/bots/7",
            StatusCode::NO_CONTENT,
            "",
        );
        let client = client_with(transport);

        let () = client.delete("/bots/7", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_path_rejected_locally() {
        let client = client_with(ScriptedTransport::new());

        let result: Result<Value> = client.get("  ", None).await;
        assert!(matches!(result, Err(Error::InvalidPath(_))));
        assert_eq!(client.transport().total_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let transport = ScriptedTransport::new()
            .expired()
            .refresh_delay(Duration::from_millis(25));
        let client = client_with(transport);

        let (first, second) = tokio::join!(
            client.get::<Value>("/account", None),
            client.get::<Value>("/account", None),
        );

        assert_eq!(first.unwrap(), json!({ "path": "/account" }));
        assert_eq!(second.unwrap(), json!({ "path": "/account" }));
        assert_eq!(client.transport().refresh_calls(), 1);
        // Two rejected attempts plus two replays
        assert_eq!(client.transport().calls(Method::GET, "/account"), 4);
        assert!(!client.is_refreshing());
    }

    #[tokio::test]
    async fn test_many_concurrent_401s_share_one_refresh() {
        let transport = ScriptedTransport::new()
            .expired()
            .refresh_delay(Duration::from_millis(10));
        let client = client_with(transport);

        let paths = ["/account", "/bots", "/strategies", "/trades", "/backtests"];
        let results = futures::future::join_all(
            paths.iter().map(|path| client.get::<Value>(path, None)),
        )
        .await;

        for (path, result) in paths.iter().zip(results) {
            assert_eq!(result.unwrap(), json!({ "path": path }));
        }
        assert_eq!(client.transport().refresh_calls(), 1);
        assert_eq!(client.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_rejects_all_and_expires_session_once() {
        let store = Arc::new(CountingStore::default());
        store.set(USER_KEY, r#"{"id":"u_1","email":"ada@example.com"}"#).unwrap();
        store.set(SESSION_KEY, "s_1").unwrap();

        let transport = ScriptedTransport::new()
            .expired()
            .refresh_fails()
            .refresh_delay(Duration::from_millis(10));
        let client =
            AuthenticatedHttpClient::with_transport(Config::default(), transport, store.clone());
        let mut events = client.subscribe();

        let (first, second) = tokio::join!(
            client.get::<Value>("/account", None),
            client.get::<Value>("/positions", None),
        );

        for result in [first, second] {
            let err = result.unwrap_err();
            assert!(err.is_session_expired(), "unexpected error: {err}");
        }
        assert_eq!(client.transport().refresh_calls(), 1);
        assert!(store.get(USER_KEY).is_none());
        assert!(store.get(SESSION_KEY).is_none());
        assert_eq!(store.removals(USER_KEY), 1);
        assert_eq!(store.removals(SESSION_KEY), 1);

        assert_eq!(
            events.try_recv().unwrap(),
            AuthEvent::SessionExpired { login_route: "/login".to_string() }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_401_after_refresh_is_not_retried() {
        let transport = ScriptedTransport::new()
            .expired()
            .reject_after_refresh(Method::GET, "/admin/users");
        let client = client_with(transport);

        let result: Result<Value> = client.get("/admin/users", None).await;

        let err = result.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(!err.is_session_expired());
        assert_eq!(client.transport().refresh_calls(), 1);
        assert_eq!(client.transport().calls(Method::GET, "/admin/users"), 2);
    }

    #[tokio::test]
    async fn test_late_401_after_refresh_replays_without_refreshing() {
        let transport = ScriptedTransport::new()
            .expired()
            .delay(Method::GET, "/slow", Duration::from_millis(40));
        let client = client_with(transport);

        // `/slow` goes out with the expired session and is rejected only after
        // `/fast` has already renewed it
        let (slow, fast) = tokio::join!(
            client.get::<Value>("/slow", None),
            client.get::<Value>("/fast", None),
        );

        assert_eq!(slow.unwrap(), json!({ "path": "/slow" }));
        assert_eq!(fast.unwrap(), json!({ "path": "/fast" }));
        assert_eq!(client.transport().refresh_calls(), 1);
        assert_eq!(client.transport().calls(Method::GET, "/slow"), 2);
    }

    #[tokio::test]
    async fn test_refreshed_event_on_success() {
        let client = client_with(ScriptedTransport::new().expired());
        let mut events = client.subscribe();

        let _: Value = client.get("/account", None).await.unwrap();

        assert_eq!(events.try_recv().unwrap(), AuthEvent::Refreshed);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let transport = ScriptedTransport::new().reply(
            Method::POST,
            "/bots/1/start",
            StatusCode::CONFLICT,
            json!({ "success": false, "message": "Bot is running", "error_code": "BOT_BUSY" }),
        );
        let client = client_with(transport);

        let err = client
            .post::<Value, Value>("/bots/1/start", None, None)
            .await
            .unwrap_err();

        match err {
            Error::Status { status, message, error_code, .. } => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert_eq!(message.as_deref(), Some("Bot is running"));
                assert_eq!(error_code.as_deref(), Some("BOT_BUSY"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
        assert_eq!(client.transport().refresh_calls(), 0);
        assert_eq!(client.transport().calls(Method::POST, "/bots/1/start"), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_propagate() {
        let client = client_with(ScriptedTransport::new().offline());

        let result: Result<Value> = client.get("/account", None).await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(client.transport().refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_skip_auth_refresh_surfaces_401() {
        let client = client_with(ScriptedTransport::new().expired());

        let result: Result<Value> = client
            .post(
                "/auth/login",
                Some(&json!({ "email": "ada@example.com", "password": "wrong" })),
                Some(RequestOptions::new().skip_auth_refresh()),
            )
            .await;

        assert!(result.unwrap_err().is_unauthorized());
        assert_eq!(client.transport().refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_explicit_refresh_joins_in_flight_refresh() {
        let transport = ScriptedTransport::new()
            .expired()
            .refresh_delay(Duration::from_millis(20));
        let client = client_with(transport);

        let (account, refreshed) = tokio::join!(
            client.get::<Value>("/account", None),
            client.refresh_session(),
        );

        assert!(account.is_ok());
        assert!(refreshed.is_ok());
        assert_eq!(client.transport().refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_upload_strips_content_type_only() {
        let client = client_with(ScriptedTransport::new());
        let file = FilePart::new("trades.csv", b"symbol,qty\nSPY,10\n".to_vec());
        let options = RequestOptions::new()
            .with_header("Content-Type", "application/json")
            .with_header("X-Import-Source", "broker-export");

        let _: Value = client.upload("/trades/import", file.clone(), Some(options)).await.unwrap();

        let sent = client.transport().last_request(Method::POST, "/trades/import").unwrap();
        assert_eq!(sent.body, RequestBody::Multipart(file));
        assert_eq!(sent.header("X-Import-Source"), Some("broker-export"));
        assert_eq!(sent.header("Content-Type"), None);
    }

    #[tokio::test]
    async fn test_health_check_never_fails() {
        let healthy = client_with(ScriptedTransport::new().reply(
            Method::GET,
            HEALTH_PATH,
            StatusCode::OK,
            json!({ "status": "healthy" }),
        ));
        assert!(healthy.health_check().await);

        let degraded = client_with(ScriptedTransport::new().reply(
            Method::GET,
            HEALTH_PATH,
            StatusCode::OK,
            json!({ "status": "degraded" }),
        ));
        assert!(!degraded.health_check().await);

        let offline = client_with(ScriptedTransport::new().offline());
        assert!(!offline.health_check().await);
    }

    #[tokio::test]
    async fn test_health_check_skips_api_prefix_and_refresh() {
        let client = client_with(ScriptedTransport::new().expired());

        assert!(!client.health_check().await);

        let sent = client.transport().last_request(Method::GET, HEALTH_PATH).unwrap();
        assert_eq!(sent.url, "http://localhost:8000/health");
        assert_eq!(client.transport().refresh_calls(), 0);
    }

    #[test]
    fn test_decode_plain_text_body() {
        let text: String = decode(b"pong").unwrap();
        assert_eq!(text, "pong");
    }
}
