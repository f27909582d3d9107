//! # therapist-session
//!
//! Session credential lifecycle for the therapist companion API.
//!
//! Every authenticated request carries the current access credential. When the
//! server answers 401, the request waits on a single shared refresh and is
//! replayed once with the new credential. If the refresh fails, the session
//! ends: the credential is cleared, every waiting request is rejected, and the
//! UI shell hears about it exactly once through the [`SessionEventBus`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use therapist_session::{Client, ClientConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), therapist_session::Error> {
//!     let client = Client::new(ClientConfig::from_env())?;
//!
//!     client.events().subscribe(|event: &SessionEvent| {
//!         println!("{}", event.description());
//!     });
//!
//!     let user = match client.session().restore().await {
//!         Ok(user) => user,
//!         Err(_) => client.session().login("dr.ruiz@example.com", "secret").await?,
//!     };
//!     println!("Signed in as {}", user.email);
//!
//!     let events: serde_json::Value = client.get_json("/companion/events").await?;
//!     println!("{}", events);
//!
//!     client.session().logout().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod client;
pub mod config;
pub mod events;
pub mod types;

pub use auth::{
    AuthApi, AuthBackend, AuthSession, Credential, CredentialSnapshot, CredentialStore,
    RefreshCoordinator, RefreshFailure, RefreshOutcome,
};
pub use client::{ApiRequest, Client, ClientBuilder, RequestInterceptor, RetryQueue};
pub use config::ClientConfig;
pub use events::{EndReason, SessionEvent, SessionEventBus, SubscriptionId};
pub use types::{AuthResponse, ErrorResponse, RegisterRequest, TokenResponse, User};

/// Error type for therapist-session operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Login, register or Google sign-in was rejected.
    #[error("Invalid credentials: {message}")]
    InvalidCredentials { message: String },

    /// The server rejected the access credential and recovery was not possible.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// The refresh cycle failed and the session has ended.
    #[error("Session refresh failed: {0}")]
    RefreshFailed(#[from] RefreshFailure),

    /// Network connectivity or request failed.
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error (HTTP {status}): {message}", status = status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()))]
    Api {
        message: String,
        status: Option<u16>,
    },

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to parse a response.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected sign-in or access credential (401, 403)
    Authorization,
    /// The session is over; the user must sign in again
    SessionExpired,
    /// Network or server errors that may succeed on retry
    Transient,
    /// Configuration or setup errors
    Configuration,
    /// Internal errors (JSON, unexpected responses)
    Internal,
}

impl Error {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Error::Unauthorized {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidCredentials { .. } | Error::Unauthorized { .. } => {
                ErrorCategory::Authorization
            }
            Error::Api {
                status: Some(401 | 403),
                ..
            } => ErrorCategory::Authorization,

            Error::RefreshFailed(_) => ErrorCategory::SessionExpired,

            Error::Network(_) => ErrorCategory::Transient,
            Error::Api {
                status: Some(500..=599),
                ..
            } => ErrorCategory::Transient,

            Error::Config(_) => ErrorCategory::Configuration,

            Error::Json(_) | Error::Parse(_) | Error::Api { .. } => ErrorCategory::Internal,
        }
    }

    pub fn is_authorization_error(&self) -> bool {
        self.category() == ErrorCategory::Authorization
    }

    pub fn is_session_expired(&self) -> bool {
        self.category() == ErrorCategory::SessionExpired
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// The server rejected the access credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized { .. }
                | Error::Api {
                    status: Some(401),
                    ..
                }
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Unauthorized { .. } => Some(401),
            Error::Api { status, .. } => *status,
            Error::RefreshFailed(failure) => failure.status,
            Error::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Consume a non-success response into an error carrying the server's
    /// `detail` message.
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::from_status(status, &body)
    }

    /// An empty body falls back to the status reason phrase.
    fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let mut message = types::ErrorResponse::message_from_body(body);
        if message.trim().is_empty() {
            message = status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            Error::Unauthorized { message }
        } else {
            Error::Api {
                message,
                status: Some(status.as_u16()),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
