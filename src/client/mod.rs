//! HTTP client for the companion API with transparent credential refresh.

mod interceptor;
mod request;
mod retry;

pub use interceptor::RequestInterceptor;
pub use request::ApiRequest;
pub use retry::RetryQueue;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::auth::{AuthApi, AuthBackend, AuthSession, CredentialStore, RefreshCoordinator};
use crate::config::ClientConfig;
use crate::events::SessionEventBus;
use crate::{Error, Result};

/// Every authenticated call goes through [`Client::send`] or one of the typed
/// helpers, which attach the current credential and recover from a single 401
/// by joining the shared refresh.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    store: CredentialStore,
    events: SessionEventBus,
    coordinator: RefreshCoordinator,
    retry: RetryQueue,
    session: AuthSession,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Configuration from `THERAPIST_API_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env())
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Login, logout, restore and identity.
    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn events(&self) -> &SessionEventBus {
        &self.events
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn send(&self, request: ApiRequest) -> Result<reqwest::Response> {
        self.retry.execute(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::post(path).with_json(body)?).await
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::put(path).with_json(body)?).await
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::patch(path).with_json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(ApiRequest::delete(path)).await?;
        Ok(())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.config.base_url)
            .field("authenticated", &self.store.is_authenticated())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    config: Option<ClientConfig>,
    base_url: Option<String>,
    timeout: Option<Duration>,
    user_agent: Option<String>,
    http: Option<reqwest::Client>,
    events: Option<SessionEventBus>,
    backend: Option<Arc<dyn AuthBackend>>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Use a preconfigured reqwest client. It must keep a cookie store for the
    /// refresh cookie to reach `/auth/refresh`; timeout and user agent from the
    /// config are not applied to it.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Share an event bus the UI shell already subscribed to.
    pub fn events(mut self, events: SessionEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the HTTP refresh backend used by the refresh coordinator.
    pub fn backend(mut self, backend: Arc<dyn AuthBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<Client> {
        let mut config = self.config.unwrap_or_default();
        if let Some(url) = self.base_url {
            config = config.with_base_url(url);
        }
        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }
        if let Some(user_agent) = self.user_agent {
            config = config.with_user_agent(user_agent);
        }
        config.validate()?;

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(config.timeout)
                .user_agent(config.user_agent.clone())
                .cookie_store(true)
                .build()
                .map_err(Error::Network)?,
        };

        let config = Arc::new(config);
        let store = CredentialStore::new();
        let events = self.events.unwrap_or_default();
        let api = AuthApi::new(http.clone(), Arc::clone(&config));

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(api.clone()) as Arc<dyn AuthBackend>);
        tracing::debug!(
            base_url = %config.base_url,
            backend = backend.name(),
            "Building client"
        );

        let coordinator = RefreshCoordinator::new(store.clone(), backend, events.clone());
        let retry = RetryQueue::new(
            http,
            Arc::clone(&config),
            store.clone(),
            coordinator.clone(),
        );
        let session = AuthSession::new(
            api,
            store.clone(),
            coordinator.clone(),
            events.clone(),
            retry.clone(),
        );

        Ok(Client {
            config,
            store,
            events,
            coordinator,
            retry,
            session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builder_defaults() {
        let client = Client::builder().build().unwrap();
        assert_eq!(client.config().base_url, crate::config::DEFAULT_BASE_URL);
        assert!(!client.credentials().is_authenticated());
        assert_eq!(client.coordinator().refresh_cycles(), 0);
    }

    #[test]
    fn test_builder_overrides() {
        let client = Client::builder()
            .config(ClientConfig::new("http://localhost:8000"))
            .base_url("https://api.example.com")
            .timeout(Duration::from_secs(5))
            .user_agent("companion-shell/2.1")
            .build()
            .unwrap();

        assert_eq!(client.config().base_url, "https://api.example.com");
        assert_eq!(client.config().timeout, Duration::from_secs(5));
        assert_eq!(client.config().user_agent, "companion-shell/2.1");
        assert!(format!("{:?}", client).contains("api.example.com"));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let err = Client::builder().base_url("not a url").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_shared_event_bus() {
        let events = SessionEventBus::new();
        let client = Client::builder().events(events.clone()).build().unwrap();

        events.session_started();
        assert!(client.events().is_active());
    }
}
