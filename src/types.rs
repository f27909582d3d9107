//! Wire types for the `/auth/*` endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Credential;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

fn default_token_type() -> String {
    "bearer".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

/// Authenticated identity returned by `/auth/me` and the login endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub onboarding_completed: bool,
    #[serde(default)]
    pub professional_role: Option<String>,
    #[serde(default)]
    pub years_experience: Option<u32>,
    #[serde(default)]
    pub primary_stressor: Option<String>,
    #[serde(default)]
    pub coping_style: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Body of a successful login, register or Google sign-in.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub user: User,
}

impl AuthResponse {
    pub fn credential(&self) -> Credential {
        Credential::new(self.access_token.clone())
    }
}

/// Body of a successful `/auth/refresh`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

impl RegisterRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            full_name: None,
        }
    }

    pub fn with_full_name(mut self, name: impl Into<String>) -> Self {
        self.full_name = Some(name.into());
        self
    }
}

/// Google ID token obtained by the UI from the OAuth popup.
#[derive(Debug, Clone, Serialize)]
pub struct GoogleLoginRequest {
    pub credential: String,
}

/// Server error body: `{"detail": "..."}`.
///
/// Validation failures carry a list of objects in `detail` instead of a string.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl ErrorResponse {
    /// Best-effort message from a raw response body.
    pub fn message_from_body(body: &str) -> String {
        match serde_json::from_str::<ErrorResponse>(body) {
            Ok(parsed) => match parsed.detail {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => truncate_body(body),
                other => truncate_body(&other.to_string()),
            },
            Err(_) => truncate_body(body),
        }
    }
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}... (truncated, {} total bytes)",
        &body[..end],
        body.len()
    )
}
