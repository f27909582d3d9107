//! Session credential lifecycle.
//!
//! - **CredentialStore**: the one place the current access credential lives
//! - **RefreshCoordinator**: single-flight refresh shared by all waiters
//! - **AuthBackend / AuthApi**: the `/auth/*` HTTP calls
//! - **AuthSession**: login, logout and startup restore

mod backend;
mod coordinator;
mod credential;
mod session;
mod store;

pub use backend::{
    AuthApi, AuthBackend, GOOGLE_PATH, LOGIN_PATH, LOGOUT_PATH, ME_PATH, REFRESH_PATH,
    REGISTER_PATH,
};
pub use coordinator::{RefreshCoordinator, RefreshFailure, RefreshOutcome};
pub use credential::Credential;
pub use session::AuthSession;
pub use store::{CredentialSnapshot, CredentialStore};
