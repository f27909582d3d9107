//! Session lifecycle notifications for the UI shell.
//!
//! The interceptor layer never talks to the UI directly. When a session is
//! torn down it emits [`SessionEvent::Ended`] here; the shell subscribes once
//! at startup and returns to the login screen.
//!
//! Emission is at most once per session: the bus is armed when a credential
//! is established (login, register, successful refresh) and disarmed by the
//! first termination. Later rejections from requests that were queued behind
//! the same failed refresh find the bus disarmed and stay silent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

/// Default channel capacity for async listeners.
const DEFAULT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The refresh endpoint rejected the durable credential or was unreachable.
    RefreshFailed,
    /// The user logged out.
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ended { reason: EndReason },
}

impl SessionEvent {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ended {
                reason: EndReason::RefreshFailed,
            } => "session ended: refresh failed",
            Self::Ended {
                reason: EndReason::LoggedOut,
            } => "session ended: logged out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct BusInner {
    active: AtomicBool,
    next_id: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, Handler)>>,
    sender: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionEventBus {
    inner: Arc<BusInner>,
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventBus")
            .field("active", &self.is_active())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                active: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                handlers: RwLock::new(Vec::new()),
                sender,
            }),
        }
    }

    /// Register a callback. Handlers run synchronously on the emitting task.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Async receiver for shells that prefer a channel over callbacks.
    pub fn listen(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.sender.subscribe()
    }

    /// Arm the bus: a session now exists and its end must be announced.
    pub fn session_started(&self) {
        if !self.inner.active.swap(true, Ordering::AcqRel) {
            tracing::debug!("Session started");
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Announce the end of the current session.
    ///
    /// Emits when the bus is armed, or when the caller has just removed a
    /// credential from the store (`credential_removed`). The latter covers
    /// credentials installed directly on the store, which never arm the bus.
    /// Only one caller can remove a given credential, so either way the
    /// announcement happens at most once per termination. Returns `false`
    /// without notifying anyone otherwise.
    pub fn end_session(&self, reason: EndReason, credential_removed: bool) -> bool {
        let was_active = self.inner.active.swap(false, Ordering::AcqRel);
        if !was_active && !credential_removed {
            tracing::debug!(?reason, "Session already ended, suppressing notification");
            return false;
        }

        let event = SessionEvent::Ended { reason };
        tracing::warn!(?reason, "{}", event.description());
        self.emit(&event);
        true
    }

    fn emit(&self, event: &SessionEvent) {
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            handler(event);
        }

        // No listeners is fine.
        let _ = self.inner.sender.send(event.clone());
    }

    fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
