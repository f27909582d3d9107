//! Response-side 401 handling.
//!
//! Per request: `Initial → AwaitingRefresh → Retried → Resolved | Rejected`.
//! A 401 on a request that has not been retried parks it on the shared refresh
//! outcome, then replays it once with whatever credential the store holds.
//! Any other status, and every transport error, goes back to the caller as is.

use std::sync::Arc;

use reqwest::StatusCode;

use super::ApiRequest;
use super::interceptor::RequestInterceptor;
use crate::auth::{CredentialSnapshot, CredentialStore, RefreshCoordinator};
use crate::config::ClientConfig;
use crate::{Error, Result};

/// What to do with a request that just came back 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Wait on the refresh coordinator, then replay.
    Refresh,
    /// Someone else already installed a newer credential: replay right away.
    Replay,
    /// The credential this request carried was torn down: the session is over.
    Reject,
}

fn recovery_for(sent: &CredentialSnapshot, current: &CredentialSnapshot) -> Recovery {
    if current.generation == sent.generation {
        return Recovery::Refresh;
    }
    match (sent.is_authenticated(), current.is_authenticated()) {
        (_, true) => Recovery::Replay,
        (true, false) => Recovery::Reject,
        (false, false) => Recovery::Refresh,
    }
}

#[derive(Clone)]
pub struct RetryQueue {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    interceptor: RequestInterceptor,
    store: CredentialStore,
    coordinator: RefreshCoordinator,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("base_url", &self.config.base_url)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl RetryQueue {
    pub fn new(
        http: reqwest::Client,
        config: Arc<ClientConfig>,
        store: CredentialStore,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            http,
            config,
            interceptor: RequestInterceptor::new(store.clone()),
            store,
            coordinator,
        }
    }

    /// Issue a request, recovering transparently from one expired credential.
    ///
    /// Resolves with the successful response of the original or replayed call.
    /// Rejects with `Error::Unauthorized` when the refresh fails or the replay
    /// is refused too, with `Error::Api` for other non-2xx statuses, and with
    /// `Error::Network` for transport failures.
    pub async fn execute(&self, mut request: ApiRequest) -> Result<reqwest::Response> {
        loop {
            let (response, sent) = self.dispatch(&request).await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return check_status(response).await;
            }

            let rejection = Error::from_response(response).await;

            if request.is_retried() {
                tracing::debug!(
                    method = %request.method(),
                    path = request.path(),
                    "401 on replayed request, rejecting"
                );
                return Err(rejection);
            }
            request.mark_retried();

            match recovery_for(&sent, &self.store.snapshot()) {
                Recovery::Replay => {
                    tracing::debug!(
                        path = request.path(),
                        sent_generation = sent.generation,
                        "Credential changed since dispatch, replaying"
                    );
                }
                Recovery::Reject => {
                    tracing::debug!(path = request.path(), "Session torn down since dispatch");
                    return Err(rejection);
                }
                Recovery::Refresh => {
                    tracing::debug!(
                        method = %request.method(),
                        path = request.path(),
                        "401 received, awaiting credential refresh"
                    );
                    if let Err(failure) = self.coordinator.ensure_fresh_credential().await {
                        tracing::debug!(
                            path = request.path(),
                            error = %failure,
                            "Refresh failed, rejecting with original error"
                        );
                        return Err(rejection);
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
    ) -> Result<(reqwest::Response, CredentialSnapshot)> {
        let url = self.config.endpoint(request.path());
        let mut builder = self.http.request(request.method().clone(), &url);
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        let (builder, sent) = self.interceptor.apply(builder);
        tracing::debug!(
            method = %request.method(),
            url = %url,
            generation = sent.generation,
            retried = request.is_retried(),
            "Dispatching request"
        );

        let response = builder.send().await?;
        Ok((response, sent))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(Error::from_response(response).await)
    }
}
