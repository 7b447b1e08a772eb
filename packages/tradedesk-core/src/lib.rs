//! Tradedesk Core - Authenticated HTTP client for the Tradedesk backend.
//!
//! This crate provides everything a front end needs to talk to the backend:
//!
//! - **API client**: `get`/`post`/`put`/`patch`/`delete`/`upload` with response
//!   envelope unwrapping and a 30 second timeout
//! - **Session refresh**: a single refresh per expiry episode, no matter how many
//!   requests hit a 401 at the same time
//! - **Session store**: the client-side slots holding cached user and session data
//! - **Auth service**: login, logout, registration and session activity tracking
//!
//! # Example
//!
//! ```rust,no_run
//! use tradedesk_core::{api, AuthService, Config};
//!
//! # async fn run() -> tradedesk_core::Result<()> {
//! // One client per process; every caller shares its refresh state
//! let client = api::init(Config::from_env())?;
//!
//! let account: serde_json::Value = client.get("/account", None).await?;
//! println!("{account}");
//!
//! let auth = AuthService::new(client);
//! if !auth.is_authenticated().await {
//!     println!("not signed in");
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod events;
pub mod session;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

// Re-export commonly used types
pub use api::{
    ApiClient, ApiRequest, AuthenticatedHttpClient, FilePart, PersistentCookies, RefreshCoordinator,
    ReqwestTransport, RequestBody, RequestOptions, Transport, TransportResponse,
};
pub use auth::AuthService;
pub use config::Config;
pub use events::{AuthEvent, LoginRedirect, Navigator};
pub use session::{FileSessionStore, MemorySessionStore, SessionStore};
pub use reqwest::{Method, StatusCode};
pub use types::{
    ApiResponse, AuthResponse, LoginCredentials, PasswordChangeData, RegisterData, UserInfo,
};

/// Error types for tradedesk-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request failed: {status}{}", .message.as_deref().map(|m| format!(" {m}")).unwrap_or_default())]
    Status {
        status: StatusCode,
        message: Option<String>,
        error_code: Option<String>,
        body: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request path: {0:?}")]
    InvalidPath(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Session refresh failed: {0}")]
    RefreshFailed(Arc<Error>),

    #[error("Session refresh was abandoned before it completed")]
    RefreshCancelled,

    #[error("API client not initialized")]
    NotInitialized,
}

impl Error {
    /// HTTP status of the failed response, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::Transport(err) => err.status(),
            _ => None,
        }
    }

    /// Whether the server rejected the request's credentials.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }

    /// Whether the session could not be renewed and the user must sign in again.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Error::RefreshFailed(_))
    }
}

/// Result type for tradedesk-core operations.
pub type Result<T> = std::result::Result<T, Error>;
