//! Wire types shared with the Tradedesk backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Response envelope used by most backend endpoints.
///
/// Endpoints that don't wrap their responses return the payload directly;
/// [`unwrap_envelope`] handles both shapes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response.
    pub fn ok(data: T) -> Self {
        Self {
            success: Some(true),
            data: Some(data),
            message: None,
            error_code: None,
        }
    }

    /// Create an error response.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            data: None,
            message: Some(message.into()),
            error_code: None,
        }
    }

    /// Attach a machine-readable error code.
    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

/// Extract the payload of a response body.
///
/// Returns the `data` field when the body is an object carrying one, otherwise
/// the body itself.
pub fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Error details carried by a non-2xx response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl ErrorBody {
    pub(crate) fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    /// Human readable message: `message`, or a string `detail` (FastAPI style).
    pub(crate) fn summary(&self) -> Option<String> {
        if let Some(message) = &self.message {
            return Some(message.clone());
        }
        match &self.detail {
            Some(Value::String(detail)) => Some(detail.clone()),
            Some(detail @ (Value::Array(_) | Value::Object(_))) => Some(detail.to_string()),
            _ => None,
        }
    }
}

/// Body of the liveness endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HealthStatus {
    pub status: String,
}

// ============================================================================
// Auth Types
// ============================================================================

/// Credentials for `POST /auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remember_me: Option<bool>,
}

impl LoginCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            remember_me: None,
        }
    }
}

/// Payload for `POST /auth/signup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterData {
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

/// Token response of the login endpoint. Tokens also arrive as cookies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub user_id: String,
}

/// Payload for `POST /auth/change-password`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordChangeData {
    pub current_password: String,
    pub new_password: String,
    pub confirm_new_password: String,
}

/// Profile of the signed-in user.
///
/// Fields the backend adds later are kept in `extra` so a cached profile
/// round-trips without loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two_factor: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_display_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserInfo {
    /// Display name, falling back to the email address.
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) if !last.is_empty() => format!("{} {}", first, last),
            (Some(first), _) if !first.is_empty() => first.clone(),
            _ => self.email.clone(),
        }
    }
}
