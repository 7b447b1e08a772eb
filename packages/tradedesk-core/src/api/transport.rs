//! Transports that put [`ApiRequest`]s on the wire.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::CookieStore;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};

use super::request::{ApiRequest, RequestBody};
use crate::{Error, Result};

/// Raw response as seen by the client, before envelope handling.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        Self::new(status, body.to_string())
    }

    /// Body as text, for logs and error messages.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends a request and returns whatever the server answered.
///
/// Transports report every HTTP status as `Ok`; only failures to get an answer
/// at all (connection errors, timeouts) are `Err`. Credentials travel with the
/// transport (cookies), the client never touches them.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<TransportResponse>> + Send;
}

/// Production transport backed by `reqwest`.
///
/// Keeps a cookie store so the session cookies set by login and refresh are
/// sent with every call.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Create a transport with a cookie store and the given default timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }

    /// Create a transport whose cookies live in `cookies`.
    pub fn with_cookie_provider<C>(timeout: Duration, cookies: Arc<C>) -> Result<Self>
    where
        C: CookieStore + 'static,
    {
        let client = Client::builder()
            .cookie_provider(cookies)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }

    /// Wrap an existing `reqwest` client.
    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn headers(request: &ApiRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.options.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidHeader(name.clone()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| Error::InvalidHeader(name.clone()))?;
            headers.append(header_name, header_value);
        }
        Ok(headers)
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<TransportResponse> {
        let timeout = request.options.timeout.unwrap_or(self.timeout);
        let mut headers = Self::headers(request)?;

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(timeout);
        if !request.options.query.is_empty() {
            builder = builder.query(&request.options.query);
        }

        builder = match &request.body {
            RequestBody::Multipart(file) => {
                // reqwest sets the multipart content type with its boundary
                headers.remove(CONTENT_TYPE);
                builder.headers(headers).multipart(file.to_form()?)
            }
            RequestBody::Json(value) => {
                headers
                    .entry(CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static("application/json"));
                builder.headers(headers).json(value)
            }
            RequestBody::Empty => {
                headers
                    .entry(CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static("application/json"));
                builder.headers(headers)
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|err| classify(err, timeout))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| classify(err, timeout))?;

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        Error::Timeout(timeout)
    } else {
        Error::Transport(err)
    }
}
