//! Single-flight refresh of the access credential.
//!
//! Any number of callers may ask for a fresh credential at once; exactly one
//! refresh call goes out and every caller observes its outcome.
//!
//! The state is `Idle` or `Refreshing(outcome)`, where `outcome` is a shared
//! future over the spawned refresh task. The check-then-create step runs under
//! a `std::sync::Mutex` that is never held across an `.await`, so on a
//! multi-threaded runtime two callers can never both see `Idle`.
//!
//! The refresh runs in its own task: callers can stop waiting, but the refresh
//! itself always runs to completion and resolves for whoever is still waiting.
//!
//! A cycle only writes the store if nothing else did since the cycle started.
//! A logout or login that lands mid-refresh wins: the refreshed credential is
//! discarded and waiters observe whatever the store holds afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use super::{AuthBackend, Credential, CredentialSnapshot, CredentialStore};
use crate::events::{EndReason, SessionEventBus};
use crate::types::User;
use crate::{Error, Result};

/// Result every waiter of one refresh cycle receives.
pub type RefreshOutcome = std::result::Result<Credential, RefreshFailure>;

type SharedOutcome = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Why a refresh cycle failed. Cloned to every waiter of the cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RefreshFailure {
    pub message: String,
    /// HTTP status of the failing call, if the server answered.
    pub status: Option<u16>,
}

impl RefreshFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            message: err.to_string(),
            status: err.status_code(),
        }
    }
}

enum RefreshState {
    Idle,
    Refreshing { cycle: u64, outcome: SharedOutcome },
}

struct Inner {
    state: Mutex<RefreshState>,
    cycles: AtomicU64,
    store: CredentialStore,
    backend: Arc<dyn AuthBackend>,
    events: SessionEventBus,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("backend", &self.inner.backend.name())
            .field("refreshing", &self.is_refreshing())
            .field("cycles", &self.refresh_cycles())
            .finish()
    }
}

impl RefreshCoordinator {
    pub fn new(
        store: CredentialStore,
        backend: Arc<dyn AuthBackend>,
        events: SessionEventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RefreshState::Idle),
                cycles: AtomicU64::new(0),
                store,
                backend,
                events,
            }),
        }
    }

    /// Join the in-flight refresh, or start one if none is running.
    ///
    /// Never called speculatively: the retry path invokes it after a 401 and
    /// session restore invokes it explicitly at startup.
    ///
    /// On success the store already holds the new credential when this
    /// resolves. On failure the store is cleared and, if it held a credential,
    /// the session-ended event has been emitted (once for the whole cycle).
    pub async fn ensure_fresh_credential(&self) -> RefreshOutcome {
        self.join_or_start().await
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock_state(), RefreshState::Refreshing { .. })
    }

    /// Number of refresh cycles started since creation.
    pub fn refresh_cycles(&self) -> u64 {
        self.inner.cycles.load(Ordering::Acquire)
    }

    fn join_or_start(&self) -> SharedOutcome {
        let mut state = self.lock_state();

        if let RefreshState::Refreshing { cycle, outcome } = &*state {
            tracing::debug!(cycle = *cycle, "Joining in-flight refresh");
            return outcome.clone();
        }

        let cycle = self.inner.cycles.fetch_add(1, Ordering::AcqRel) + 1;
        let started = self.inner.store.snapshot();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(cycle, started).await });

        let outcome = async move {
            task.await.unwrap_or_else(|e| {
                Err(RefreshFailure::new(format!("refresh task aborted: {}", e)))
            })
        }
        .boxed()
        .shared();

        *state = RefreshState::Refreshing {
            cycle,
            outcome: outcome.clone(),
        };
        outcome
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    async fn run(&self, cycle: u64, started: CredentialSnapshot) -> RefreshOutcome {
        tracing::info!(
            cycle,
            backend = self.backend.name(),
            generation = started.generation,
            "Refreshing access credential"
        );

        let outcome = match self.refresh_and_identify().await {
            Ok((credential, user)) => {
                if self
                    .store
                    .set_session_if_current(started.generation, credential.clone(), user)
                {
                    tracing::info!(
                        cycle,
                        generation = self.store.generation(),
                        "Access credential refreshed"
                    );
                    self.events.session_started();
                    Ok(credential)
                } else {
                    self.superseded(cycle)
                        .ok_or_else(|| RefreshFailure::new("session ended during refresh"))
                }
            }
            Err(e) => {
                let failure = RefreshFailure::from_error(&e);
                if self.store.clear_if_current(started.generation) {
                    tracing::warn!(cycle, error = %e, "Credential refresh failed, ending session");
                    self.events
                        .end_session(EndReason::RefreshFailed, started.is_authenticated());
                    Err(failure)
                } else {
                    self.superseded(cycle).ok_or(failure)
                }
            }
        };

        self.finish(cycle);
        outcome
    }

    async fn refresh_and_identify(&self) -> Result<(Credential, User)> {
        let credential = self.backend.refresh().await?;
        let user = self.backend.identity(&credential).await?;
        Ok((credential, user))
    }

    /// The store was written by someone else during the cycle. Leave it alone
    /// and hand waiters whatever it holds now.
    fn superseded(&self, cycle: u64) -> Option<Credential> {
        let current = self.store.get();
        tracing::debug!(
            cycle,
            authenticated = current.is_some(),
            "Session changed during refresh, discarding refresh result"
        );
        current
    }

    fn finish(&self, cycle: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(&*state, RefreshState::Refreshing { cycle: c, .. } if *c == cycle) {
            *state = RefreshState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::User;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_test::{assert_pending, task};
    use uuid::Uuid;

    struct FakeBackend {
        refresh_calls: AtomicUsize,
        identity_calls: AtomicUsize,
        gate: Option<Notify>,
        fail_refresh: AtomicBool,
        fail_identity: AtomicBool,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                identity_calls: AtomicUsize::new(0),
                gate: None,
                fail_refresh: AtomicBool::new(false),
                fail_identity: AtomicBool::new(false),
            }
        }

        fn gated() -> Self {
            Self {
                gate: Some(Notify::new()),
                ..Self::new()
            }
        }

        fn failing(self) -> Self {
            self.fail_refresh.store(true, Ordering::SeqCst);
            self
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.notify_one();
            }
        }

        fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn refresh(&self) -> Result<Credential> {
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_refresh.load(Ordering::SeqCst) {
                return Err(Error::Api {
                    message: "Invalid refresh token".into(),
                    status: Some(401),
                });
            }
            Ok(Credential::new(format!("fresh-{}", n)))
        }

        async fn identity(&self, _credential: &Credential) -> Result<User> {
            self.identity_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_identity.load(Ordering::SeqCst) {
                return Err(Error::Unauthorized {
                    message: "Could not validate credentials".into(),
                });
            }
            Ok(User {
                id: Uuid::new_v4(),
                email: "dr.ruiz@example.com".into(),
                full_name: Some("Ana Ruiz".into()),
                is_active: true,
                language: "es".into(),
                onboarding_completed: true,
                professional_role: None,
                years_experience: None,
                primary_stressor: None,
                coping_style: None,
                created_at: Utc::now(),
            })
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        coordinator: RefreshCoordinator,
        store: CredentialStore,
        ended: Arc<AtomicUsize>,
    }

    fn harness(backend: FakeBackend) -> Harness {
        harness_with(backend, Some("expired"), true)
    }

    fn harness_with(backend: FakeBackend, token: Option<&str>, armed: bool) -> Harness {
        let backend = Arc::new(backend);
        let store = CredentialStore::new();
        if let Some(token) = token {
            store.set(Some(Credential::new(token)));
        }
        let events = SessionEventBus::new();
        if armed {
            events.session_started();
        }

        let ended = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ended);
        events.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let coordinator = RefreshCoordinator::new(
            store.clone(),
            backend.clone() as Arc<dyn AuthBackend>,
            events,
        );
        Harness {
            backend,
            coordinator,
            store,
            ended,
        }
    }

    async fn wait_for_refresh_call(backend: &FakeBackend) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.refresh_calls() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("refresh was not called");
    }

    async fn wait_until_idle(coordinator: &RefreshCoordinator) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.is_refreshing() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("refresh did not finish");
    }

    #[tokio::test]
    async fn test_single_caller_refreshes_and_stores() {
        let h = harness(FakeBackend::new());

        let credential = h.coordinator.ensure_fresh_credential().await.unwrap();

        assert_eq!(credential.expose(), "fresh-1");
        assert_eq!(h.store.get().unwrap().expose(), "fresh-1");
        assert!(h.store.is_authenticated());
        assert_eq!(h.store.identity().unwrap().language, "es");
        assert!(!h.coordinator.is_refreshing());
        assert_eq!(h.coordinator.refresh_cycles(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let h = harness(FakeBackend::gated());

        let calls = futures::future::join_all(
            (0..8).map(|_| h.coordinator.ensure_fresh_credential()),
        );
        let release = async {
            while h.backend.refresh_calls() == 0 {
                tokio::task::yield_now().await;
            }
            assert!(h.coordinator.is_refreshing());
            h.backend.release();
        };
        let (results, ()) = tokio::join!(calls, release);

        assert_eq!(results.len(), 8);
        for result in results {
            assert_eq!(result.unwrap().expose(), "fresh-1");
        }
        assert_eq!(h.backend.refresh_calls(), 1);
        assert_eq!(h.backend.identity_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.coordinator.refresh_cycles(), 1);
    }

    #[tokio::test]
    async fn test_failure_fans_out_and_ends_session_once() {
        let h = harness(FakeBackend::gated().failing());

        let calls = futures::future::join_all(
            (0..5).map(|_| h.coordinator.ensure_fresh_credential()),
        );
        let release = async {
            while h.backend.refresh_calls() == 0 {
                tokio::task::yield_now().await;
            }
            h.backend.release();
        };
        let (results, ()) = tokio::join!(calls, release);

        for result in results {
            let failure = result.unwrap_err();
            assert_eq!(failure.status, Some(401));
        }
        assert_eq!(h.backend.refresh_calls(), 1);
        assert!(h.store.get().is_none());
        assert_eq!(h.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_identity_failure_is_refresh_failure() {
        let h = harness(FakeBackend::new());
        h.backend.fail_identity.store(true, Ordering::SeqCst);

        let failure = h.coordinator.ensure_fresh_credential().await.unwrap_err();

        assert_eq!(failure.status, Some(401));
        assert!(h.store.get().is_none());
        assert_eq!(h.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_calls_start_new_cycles() {
        let h = harness(FakeBackend::new());

        h.coordinator.ensure_fresh_credential().await.unwrap();
        let second = h.coordinator.ensure_fresh_credential().await.unwrap();

        assert_eq!(second.expose(), "fresh-2");
        assert_eq!(h.backend.refresh_calls(), 2);
        assert_eq!(h.coordinator.refresh_cycles(), 2);
    }

    #[tokio::test]
    async fn test_no_refresh_without_caller() {
        let h = harness(FakeBackend::new());
        tokio::task::yield_now().await;
        assert_eq!(h.backend.refresh_calls(), 0);
        assert_eq!(h.store.get().unwrap().expose(), "expired");
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_cancel_refresh() {
        let h = harness(FakeBackend::gated());

        let mut waiter = task::spawn(h.coordinator.ensure_fresh_credential());
        assert_pending!(waiter.poll());
        drop(waiter);

        assert!(h.coordinator.is_refreshing());
        h.backend.release();
        wait_until_idle(&h.coordinator).await;

        assert_eq!(h.backend.refresh_calls(), 1);
        assert_eq!(h.store.get().unwrap().expose(), "fresh-1");
    }

    #[tokio::test]
    async fn test_logout_during_refresh_discards_new_credential() {
        let h = harness(FakeBackend::gated());

        let coordinator = h.coordinator.clone();
        let waiter = tokio::spawn(async move { coordinator.ensure_fresh_credential().await });
        wait_for_refresh_call(&h.backend).await;

        h.store.clear();
        h.backend.release();
        let failure = waiter.await.unwrap().unwrap_err();

        assert!(failure.message.contains("session ended"));
        assert!(h.store.get().is_none());
        assert!(!h.store.is_authenticated());
        assert_eq!(h.ended.load(Ordering::SeqCst), 0);
        assert!(!h.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_login_during_refresh_wins() {
        let h = harness(FakeBackend::gated().failing());

        let coordinator = h.coordinator.clone();
        let waiter = tokio::spawn(async move { coordinator.ensure_fresh_credential().await });
        wait_for_refresh_call(&h.backend).await;

        h.store.set(Some(Credential::new("from-login")));
        h.backend.release();
        let credential = waiter.await.unwrap().unwrap();

        assert_eq!(credential.expose(), "from-login");
        assert_eq!(h.store.get().unwrap().expose(), "from-login");
        assert_eq!(h.ended.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_ends_session_installed_on_store() {
        let h = harness_with(FakeBackend::new().failing(), Some("T1"), false);

        h.coordinator.ensure_fresh_credential().await.unwrap_err();

        assert!(h.store.get().is_none());
        assert_eq!(h.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_without_credential_is_silent() {
        let h = harness_with(FakeBackend::new().failing(), None, false);

        h.coordinator.ensure_fresh_credential().await.unwrap_err();

        assert_eq!(h.ended.load(Ordering::SeqCst), 0);
        assert_eq!(h.backend.refresh_calls(), 1);
    }

    #[test]
    fn test_refresh_failure_from_error() {
        let err = Error::Api {
            message: "Refresh token not found".into(),
            status: Some(401),
        };
        let failure = RefreshFailure::from_error(&err);
        assert_eq!(failure.status, Some(401));
        assert!(failure.message.contains("Refresh token not found"));
    }
}
