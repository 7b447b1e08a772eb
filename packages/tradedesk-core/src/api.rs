//! HTTP client for the Tradedesk backend API
//!
//! The application is meant to run a single [`ApiClient`]: the session refresh
//! coordination only prevents duplicate refreshes among requests that share a
//! client. [`init`] installs that instance and [`client`] hands it out.

pub mod client;
pub mod cookies;
pub mod refresh;
pub mod request;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::*;
pub use cookies::PersistentCookies;
pub use refresh::RefreshCoordinator;
pub use request::{ApiRequest, FilePart, RequestBody, RequestOptions};
pub use transport::{ReqwestTransport, Transport, TransportResponse};

use std::sync::{Arc, OnceLock};

use crate::config::Config;
use crate::{Error, Result};

static CLIENT: OnceLock<Arc<ApiClient>> = OnceLock::new();

/// Initialize the process-wide API client.
///
/// Calling this again returns the client that is already installed; the
/// configuration passed to later calls is ignored.
pub fn init(config: Config) -> Result<Arc<ApiClient>> {
    if let Some(client) = CLIENT.get() {
        tracing::debug!("API client already initialized");
        return Ok(client.clone());
    }

    let client = Arc::new(ApiClient::from_config(config)?);
    let client = CLIENT.get_or_init(|| client).clone();
    tracing::debug!("API client initialized for {}", client.config().api_base());
    Ok(client)
}

/// Get the process-wide API client.
pub fn client() -> Result<Arc<ApiClient>> {
    CLIENT.get().cloned().ok_or(Error::NotInitialized)
}
