//! Login, logout and session restore.

use super::backend::{LOGOUT_PATH, ME_PATH};
use super::{AuthApi, CredentialStore, RefreshCoordinator};
use crate::client::{ApiRequest, RetryQueue};
use crate::events::{EndReason, SessionEventBus};
use crate::types::{AuthResponse, GoogleLoginRequest, LoginRequest, RegisterRequest, User};
use crate::{Error, Result};

/// Entry points that establish or tear down a session.
///
/// Sign-in calls bypass the retry path: a rejected password is
/// `Error::InvalidCredentials` and never triggers a refresh. Logout and
/// identity fetches go through it like any other authenticated call.
#[derive(Clone)]
pub struct AuthSession {
    api: AuthApi,
    store: CredentialStore,
    coordinator: RefreshCoordinator,
    events: SessionEventBus,
    retry: RetryQueue,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("authenticated", &self.store.is_authenticated())
            .field("events", &self.events)
            .finish()
    }
}

impl AuthSession {
    pub fn new(
        api: AuthApi,
        store: CredentialStore,
        coordinator: RefreshCoordinator,
        events: SessionEventBus,
        retry: RetryQueue,
    ) -> Self {
        Self {
            api,
            store,
            coordinator,
            events,
            retry,
        }
    }

    pub async fn login(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<User> {
        let request = LoginRequest {
            email: email.into(),
            password: password.into(),
        };
        let response = self.api.login(&request).await?;
        Ok(self.begin(response))
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<User> {
        let response = self.api.register(&request).await?;
        Ok(self.begin(response))
    }

    /// Sign in with a Google ID token obtained by the UI.
    pub async fn login_with_google(&self, id_token: impl Into<String>) -> Result<User> {
        let request = GoogleLoginRequest {
            credential: id_token.into(),
        };
        let response = self.api.login_with_google(&request).await?;
        Ok(self.begin(response))
    }

    /// End the session locally and on the server.
    ///
    /// The local teardown always happens; a failed server call is logged and
    /// otherwise ignored. `SessionEvent::Ended { reason: LoggedOut }` is
    /// emitted unless the session had already ended. A refresh that is in
    /// flight cannot bring the session back.
    pub async fn logout(&self) -> Result<()> {
        if self.store.get().is_some() {
            match self.retry.execute(ApiRequest::post(LOGOUT_PATH)).await {
                Ok(_) => tracing::debug!("Server session revoked"),
                Err(e) => {
                    tracing::warn!(error = %e, "Server logout failed, clearing local session")
                }
            }
        }

        // A refresh still in flight sees the cleared generation and discards
        // its result.
        let removed = self.store.take().is_some();
        self.events.end_session(EndReason::LoggedOut, removed);
        tracing::info!("Logged out");
        Ok(())
    }

    /// Recover a session at startup from the refresh cookie alone.
    ///
    /// Resolves with the restored identity, or `Error::RefreshFailed` when no
    /// valid refresh credential exists. A cold start without a session emits
    /// no event.
    pub async fn restore(&self) -> Result<User> {
        self.coordinator
            .ensure_fresh_credential()
            .await
            .map_err(Error::RefreshFailed)?;

        match self.store.identity() {
            Some(user) => Ok(user),
            None => self.fetch_identity().await,
        }
    }

    /// Re-read `/auth/me` and update the cached identity.
    ///
    /// An auth rejection forgets the identity; transient failures keep it.
    pub async fn fetch_identity(&self) -> Result<User> {
        let result = async {
            let response = self.retry.execute(ApiRequest::get(ME_PATH)).await?;
            let bytes = response.bytes().await?;
            Ok::<User, Error>(serde_json::from_slice(&bytes)?)
        }
        .await;

        match result {
            Ok(user) => {
                self.store.set_identity(Some(user.clone()));
                Ok(user)
            }
            Err(e) => {
                if e.is_unauthorized() {
                    self.store.set_identity(None);
                }
                Err(e)
            }
        }
    }

    pub fn current_user(&self) -> Option<User> {
        self.store.identity()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    fn begin(&self, response: AuthResponse) -> User {
        self.store.set_session(response.credential(), response.user.clone());
        self.events.session_started();
        tracing::info!(user_id = %response.user.id, "Session established");
        response.user
    }
}
