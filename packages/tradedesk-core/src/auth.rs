//! Authentication service built on the shared API client.
//!
//! Credentials live in cookies managed by the transport; this service drives
//! the auth endpoints and keeps the client-side session slots (cached user,
//! session marker, last activity) in step with them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use tokio::task::JoinHandle;

use crate::api::{AuthenticatedHttpClient, ReqwestTransport, RequestOptions, Transport};
use crate::session::{SessionStore, AUTH_KEYS, LAST_ACTIVITY_KEY, SESSION_KEY, USER_KEY};
use crate::types::{AuthResponse, LoginCredentials, PasswordChangeData, RegisterData, UserInfo};
use crate::Result;

/// Inactivity after which a session counts as expired.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How often the session monitor checks for inactivity.
pub const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

const LOGIN_PATH: &str = "/auth/login";
const SIGNUP_PATH: &str = "/auth/signup";
const LOGOUT_PATH: &str = "/auth/logout";
const ME_PATH: &str = "/auth/me";
const CHANGE_PASSWORD_PATH: &str = "/auth/change-password";

/// Login, logout and session bookkeeping.
pub struct AuthService<T = ReqwestTransport> {
    client: Arc<AuthenticatedHttpClient<T>>,
}

impl<T> Clone for AuthService<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<T: Transport> AuthService<T> {
    pub fn new(client: Arc<AuthenticatedHttpClient<T>>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<AuthenticatedHttpClient<T>> {
        &self.client
    }

    fn store(&self) -> &dyn SessionStore {
        self.client.session_store().as_ref()
    }

    // ========================================================================
    // Auth API
    // ========================================================================

    /// Sign in and cache the user's profile.
    ///
    /// A 401 here means bad credentials, so it is returned as is rather than
    /// starting a session refresh.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<UserInfo> {
        let options = RequestOptions::new().skip_auth_refresh();
        let tokens: AuthResponse = self
            .client
            .post(LOGIN_PATH, Some(credentials), Some(options))
            .await?;
        tracing::debug!(expires_in = tokens.expires_in, "Logged in");

        let user = self.current_user().await?;
        self.store_user_data(&user)?;
        self.update_activity()?;
        tracing::info!("Signed in as {}", user.email);
        Ok(user)
    }

    /// Create an account.
    pub async fn register(&self, data: &RegisterData) -> Result<UserInfo> {
        self.client.post(SIGNUP_PATH, Some(data), None).await
    }

    /// Sign out. Local auth data is cleared even when the server call fails.
    pub async fn logout(&self) {
        let result: Result<IgnoredAny> = self.client.post::<_, ()>(LOGOUT_PATH, None, None).await;
        if let Err(e) = result {
            tracing::warn!("Logout request failed: {}", e);
        }
        self.clear_local_auth_data();
    }

    /// Fetch the signed-in user's profile.
    pub async fn current_user(&self) -> Result<UserInfo> {
        self.client.get(ME_PATH, None).await
    }

    /// Renew the session, joining a refresh already in flight.
    pub async fn refresh_token(&self) -> Result<()> {
        self.client.refresh_session().await
    }

    pub async fn change_password(&self, data: &PasswordChangeData) -> Result<()> {
        let _: IgnoredAny = self
            .client
            .post(CHANGE_PASSWORD_PATH, Some(data), None)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Session State
    // ========================================================================

    /// Whether the server accepts the current session.
    pub async fn is_authenticated(&self) -> bool {
        self.current_user().await.is_ok()
    }

    /// Check the session with the server, refreshing it once if rejected.
    ///
    /// A rejected request already renews the session on its own; an explicit
    /// refresh only follows failures that did not come from a refresh.
    pub async fn validate_session(&self) -> bool {
        match self.current_user().await {
            Ok(_) => return true,
            Err(e) if e.is_session_expired() => {
                tracing::warn!("Session validation failed: {}", e);
                return false;
            }
            Err(e) => tracing::debug!("Session check failed, refreshing: {}", e),
        }

        match self.refresh_token().await {
            Ok(()) => self.is_authenticated().await,
            Err(e) => {
                tracing::warn!("Session validation failed: {}", e);
                false
            }
        }
    }

    /// Record user activity now.
    pub fn update_activity(&self) -> Result<()> {
        self.store()
            .set(LAST_ACTIVITY_KEY, &Utc::now().to_rfc3339())
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        let raw = self.store().get(LAST_ACTIVITY_KEY)?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable activity timestamp {:?}: {}", raw, e);
                None
            }
        }
    }

    fn idle_for(&self) -> Option<Duration> {
        let last = self.last_activity()?;
        // Timestamps in the future count as no idle time
        Some((Utc::now() - last).to_std().unwrap_or_default())
    }

    /// Whether the user has been idle longer than `timeout`.
    ///
    /// No recorded activity counts as expired.
    pub fn is_session_expired(&self, timeout: Duration) -> bool {
        match self.idle_for() {
            Some(idle) => idle > timeout,
            None => true,
        }
    }

    /// Time left before the session expires from inactivity.
    pub fn session_time_remaining(&self, timeout: Duration) -> Duration {
        match self.idle_for() {
            Some(idle) => timeout.saturating_sub(idle),
            None => Duration::ZERO,
        }
    }

    /// Remove every client-side auth slot.
    pub fn clear_local_auth_data(&self) {
        for key in AUTH_KEYS {
            if let Err(e) = self.store().remove(key) {
                tracing::warn!("Failed to clear {}: {}", key, e);
            }
        }
    }

    /// Cache the user's profile and mark the session as present.
    pub fn store_user_data(&self, user: &UserInfo) -> Result<()> {
        let json = serde_json::to_string(user)?;
        self.store().set(USER_KEY, &json)?;
        self.store().set(SESSION_KEY, &user.id)
    }

    /// The cached profile, if any. Unreadable data counts as absent.
    pub fn stored_user_data(&self) -> Option<UserInfo> {
        let raw = self.store().get(USER_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!("Ignoring unreadable cached user: {}", e);
                None
            }
        }
    }

    /// Restore the signed-in user at startup.
    ///
    /// Returns the cached user when it exists, the session is not idle-expired
    /// and the server still accepts it. Otherwise local auth data is cleared.
    pub async fn initialize_auth(&self) -> Option<UserInfo> {
        let user = self.stored_user_data()?;

        if self.is_session_expired(DEFAULT_SESSION_TIMEOUT) {
            tracing::info!("Stored session is idle-expired");
            self.clear_local_auth_data();
            return None;
        }

        if !self.validate_session().await {
            self.clear_local_auth_data();
            return None;
        }

        if let Err(e) = self.update_activity() {
            tracing::warn!("Failed to record activity: {}", e);
        }
        Some(user)
    }

    // ========================================================================
    // Session Monitor
    // ========================================================================

    /// Log out once the signed-in user has been idle longer than `timeout`.
    ///
    /// Checks every [`SESSION_CHECK_INTERVAL`]; abort the handle to stop.
    pub fn spawn_session_monitor(&self, timeout: Duration) -> JoinHandle<()> {
        self.spawn_monitor(timeout, SESSION_CHECK_INTERVAL)
    }

    fn spawn_monitor(&self, timeout: Duration, every: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticks.tick().await;
                let signed_in = service.store().get(USER_KEY).is_some();
                if signed_in && service.is_session_expired(timeout) {
                    tracing::warn!("Session expired, logging out");
                    service.logout().await;
                }
            }
        })
    }
}
