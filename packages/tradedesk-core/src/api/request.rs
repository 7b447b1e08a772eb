//! Request values handed to a [`Transport`](super::Transport).

use std::path::Path;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::Value;
use uuid::Uuid;

use crate::Result;

/// Multipart field name uploads are sent under.
pub const UPLOAD_FIELD: &str = "file";

/// Optional per-call settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Extra headers, applied in order
    pub headers: Vec<(String, String)>,
    /// Query string pairs
    pub query: Vec<(String, String)>,
    /// Overrides the client timeout for this call
    pub timeout: Option<Duration>,
    /// Surface a 401 directly instead of renewing the session
    pub skip_auth_refresh: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_auth_refresh(mut self) -> Self {
        self.skip_auth_refresh = true;
        self
    }

    /// Drop caller-supplied `Content-Type` headers.
    pub(crate) fn without_content_type(mut self) -> Self {
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
        self
    }
}

/// A file attached to an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

impl FilePart {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
            mime: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Read a file from disk, named after its final path component.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self::new(file_name, bytes))
    }

    /// Build the multipart form carrying this file under [`UPLOAD_FIELD`].
    pub fn to_form(&self) -> Result<Form> {
        let mut part = Part::bytes(self.bytes.clone()).file_name(self.file_name.clone());
        if let Some(mime) = &self.mime {
            part = part.mime_str(mime)?;
        }
        Ok(Form::new().part(UPLOAD_FIELD, part))
    }
}

/// Request body encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(FilePart),
}

/// A fully resolved request.
///
/// Requests are plain values so a request rejected with 401 can be replayed
/// once the session is renewed.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Correlates log lines of one call
    pub id: Uuid,
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Path as given by the caller
    pub path: String,
    pub body: RequestBody,
    pub options: RequestOptions,
    pub(crate) retried: bool,
}

impl ApiRequest {
    pub fn new(
        method: Method,
        url: impl Into<String>,
        path: impl Into<String>,
        body: RequestBody,
        options: RequestOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            url: url.into(),
            path: path.into(),
            body,
            options,
            retried: false,
        }
    }

    /// Whether this is the replay after a session refresh.
    pub fn is_retry(&self) -> bool {
        self.retried
    }

    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.options
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}
