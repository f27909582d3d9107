//! HTTP bindings for the `/auth/*` endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Credential;
use crate::config::ClientConfig;
use crate::types::{
    AuthResponse, GoogleLoginRequest, LoginRequest, RegisterRequest, TokenResponse, User,
};
use crate::{Error, Result};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const GOOGLE_PATH: &str = "/auth/google";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const ME_PATH: &str = "/auth/me";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// What the refresh coordinator needs from the server.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Backend name for debugging.
    fn name(&self) -> &str;

    /// Mint a new access credential. The durable refresh credential travels
    /// out-of-band (cookie) and is never visible here.
    async fn refresh(&self) -> Result<Credential>;

    /// Identity the given credential belongs to.
    async fn identity(&self, credential: &Credential) -> Result<User>;
}

/// reqwest-backed implementation of every `/auth/*` call.
///
/// Shares the connection pool and cookie jar of the client that built it, so
/// the refresh cookie set by login is replayed on `/auth/refresh`.
#[derive(Clone)]
pub struct AuthApi {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl std::fmt::Debug for AuthApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthApi")
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

impl AuthApi {
    pub fn new(http: reqwest::Client, config: Arc<ClientConfig>) -> Self {
        Self { http, config }
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<AuthResponse> {
        self.sign_in(LOGIN_PATH, request).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse> {
        self.sign_in(REGISTER_PATH, request).await
    }

    pub async fn login_with_google(&self, request: &GoogleLoginRequest) -> Result<AuthResponse> {
        self.sign_in(GOOGLE_PATH, request).await
    }

    pub async fn refresh_token(&self) -> Result<TokenResponse> {
        let url = self.config.endpoint(REFRESH_PATH);
        tracing::debug!("Auth POST {}", url);

        let response = self.http.post(&url).send().await?;
        read_json(response).await
    }

    pub async fn me(&self, credential: &Credential) -> Result<User> {
        let url = self.config.endpoint(ME_PATH);
        tracing::debug!("Auth GET {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(credential.expose())
            .send()
            .await?;
        read_json(response).await
    }

    /// Login, register and Google sign-in share one contract: a rejection is
    /// `InvalidCredentials`, never a trigger for the refresh protocol.
    async fn sign_in<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<AuthResponse> {
        let url = self.config.endpoint(path);
        tracing::debug!("Auth POST {}", url);

        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status().as_u16();

        if matches!(status, 400 | 401 | 403 | 422) {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvalidCredentials {
                message: crate::types::ErrorResponse::message_from_body(&body),
            });
        }
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(Error::from_response(response).await);
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl AuthBackend for AuthApi {
    fn name(&self) -> &str {
        "http"
    }

    async fn refresh(&self) -> Result<Credential> {
        let credential = Credential::new(self.refresh_token().await?.access_token);
        if credential.is_empty() {
            return Err(Error::Parse("refresh returned an empty access token".into()));
        }
        Ok(credential)
    }

    async fn identity(&self, credential: &Credential) -> Result<User> {
        self.me(credential).await
    }
}
