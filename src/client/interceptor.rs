//! Outgoing-request credential attachment.

use crate::auth::{CredentialSnapshot, CredentialStore};

/// Reads the store at dispatch time and adds `Authorization: Bearer <token>`.
///
/// Synchronous and lock-short: nothing is cached, so a credential installed by
/// a refresh is used by the very next request. Without a credential the
/// request goes out unauthenticated and the server's 401 drives the retry path.
#[derive(Debug, Clone)]
pub struct RequestInterceptor {
    store: CredentialStore,
}

impl RequestInterceptor {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }

    /// Attach the current credential. The returned snapshot records which
    /// credential generation the request carries.
    pub fn apply(
        &self,
        req: reqwest::RequestBuilder,
    ) -> (reqwest::RequestBuilder, CredentialSnapshot) {
        let snapshot = self.store.snapshot();
        let req = match &snapshot.credential {
            Some(credential) => req.bearer_auth(credential.expose()),
            None => req,
        };
        (req, snapshot)
    }
}
