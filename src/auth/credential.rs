//! Access credential type.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Short-lived bearer token authorizing API calls.
///
/// Opaque: no shape validation and no client-side expiry. Expiry is only ever
/// discovered from a 401 on a real call. The wrapped secret is zeroized on drop
/// and never shows up in `Debug` output.
#[derive(Clone)]
pub struct Credential {
    token: SecretString,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }

    /// Raw token string. Only the interceptor and identity fetch need this.
    pub fn expose(&self) -> &str {
        self.token.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[redacted]")
            .finish()
    }
}

impl From<String> for Credential {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

impl From<&str> for Credential {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}
