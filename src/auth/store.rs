//! In-memory holder of the current access credential.

use std::sync::{Arc, PoisonError, RwLock};

use super::Credential;
use crate::types::User;

/// Point-in-time view of the store.
///
/// `generation` increases on every write, so two snapshots with the same
/// generation saw the same credential.
#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    pub generation: u64,
    pub credential: Option<Credential>,
}

impl CredentialSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    credential: Option<Credential>,
    identity: Option<User>,
}

/// Single source of truth for the access credential.
///
/// Cheap to clone; clones share the same slot. Reads never block on I/O, so
/// every `set` is visible to the very next dispatched request. Writers are the
/// refresh coordinator and the login/register/logout flows.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    slot: Arc<RwLock<Slot>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Credential> {
        self.read(|slot| slot.credential.clone())
    }

    pub fn snapshot(&self) -> CredentialSnapshot {
        self.read(|slot| CredentialSnapshot {
            generation: slot.generation,
            credential: slot.credential.clone(),
        })
    }

    /// Replace the credential. Passing `None` clears it along with the identity.
    pub fn set(&self, credential: Option<Credential>) {
        self.write(|slot| {
            slot.generation += 1;
            if credential.is_none() {
                slot.identity = None;
            }
            slot.credential = credential;
        });
    }

    /// Install a credential together with the identity it was validated against.
    pub fn set_session(&self, credential: Credential, user: User) {
        self.write(|slot| {
            slot.generation += 1;
            slot.credential = Some(credential);
            slot.identity = Some(user);
        });
    }

    /// Install a refreshed session unless the store was written since
    /// `generation`. Returns whether the credential was installed.
    pub fn set_session_if_current(
        &self,
        generation: u64,
        credential: Credential,
        user: User,
    ) -> bool {
        self.write(|slot| {
            if slot.generation != generation {
                return false;
            }
            slot.generation += 1;
            slot.credential = Some(credential);
            slot.identity = Some(user);
            true
        })
    }

    pub fn clear(&self) {
        self.set(None);
    }

    /// Clear unless the store was written since `generation`. Returns whether
    /// it was cleared.
    pub fn clear_if_current(&self, generation: u64) -> bool {
        self.write(|slot| {
            if slot.generation != generation {
                return false;
            }
            slot.generation += 1;
            slot.credential = None;
            slot.identity = None;
            true
        })
    }

    /// Clear and return the credential that was held.
    pub fn take(&self) -> Option<Credential> {
        self.write(|slot| {
            slot.generation += 1;
            slot.identity = None;
            slot.credential.take()
        })
    }

    pub fn identity(&self) -> Option<User> {
        self.read(|slot| slot.identity.clone())
    }

    /// Record the outcome of the latest identity fetch. Does not bump the generation.
    pub fn set_identity(&self, user: Option<User>) {
        self.write(|slot| slot.identity = user);
    }

    pub fn generation(&self) -> u64 {
        self.read(|slot| slot.generation)
    }

    /// Credential present and the last identity fetch succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.read(|slot| slot.credential.is_some() && slot.identity.is_some())
    }

    fn read<T>(&self, f: impl FnOnce(&Slot) -> T) -> T {
        let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Slot) -> T) -> T {
        let mut guard = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "dr.ruiz@example.com".into(),
            full_name: None,
            is_active: true,
            language: "en".into(),
            onboarding_completed: true,
            professional_role: None,
            years_experience: None,
            primary_stressor: None,
            coping_style: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_store() {
        let store = CredentialStore::new();
        assert!(store.get().is_none());
        assert!(!store.is_authenticated());
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn test_set_is_visible_to_clones() {
        let store = CredentialStore::new();
        let view = store.clone();

        store.set(Some(Credential::new("T1")));
        assert_eq!(view.get().unwrap().expose(), "T1");

        store.set(Some(Credential::new("T2")));
        assert_eq!(view.get().unwrap().expose(), "T2");
        assert_eq!(view.generation(), 2);
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let store = CredentialStore::new();
        store.set(Some(Credential::new("T1")));
        let before = store.snapshot();

        store.set(Some(Credential::new("T2")));

        assert_eq!(before.credential.unwrap().expose(), "T1");
        assert!(store.snapshot().generation > before.generation);
    }

    #[test]
    fn test_authenticated_requires_identity() {
        let store = CredentialStore::new();
        store.set(Some(Credential::new("T1")));
        assert!(!store.is_authenticated());

        store.set_identity(Some(user()));
        assert!(store.is_authenticated());
    }

    #[test]
    fn test_clear_drops_identity_and_bumps_generation() {
        let store = CredentialStore::new();
        store.set_session(Credential::new("T1"), user());
        let generation = store.generation();

        store.clear();

        assert!(store.get().is_none());
        assert!(store.identity().is_none());
        assert_eq!(store.generation(), generation + 1);
    }

    #[test]
    fn test_set_identity_keeps_generation() {
        let store = CredentialStore::new();
        store.set(Some(Credential::new("T1")));
        let generation = store.generation();
        store.set_identity(Some(user()));
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_conditional_writes_respect_generation() {
        let store = CredentialStore::new();
        store.set(Some(Credential::new("T1")));
        let started = store.generation();

        store.clear();
        assert!(!store.set_session_if_current(started, Credential::new("T2"), user()));
        assert!(store.get().is_none());
        assert!(!store.clear_if_current(started));

        let current = store.generation();
        assert!(store.set_session_if_current(current, Credential::new("T3"), user()));
        assert_eq!(store.get().unwrap().expose(), "T3");
    }

    #[test]
    fn test_clear_if_current() {
        let store = CredentialStore::new();
        store.set(Some(Credential::new("T1")));

        assert!(store.clear_if_current(store.generation()));
        assert!(store.get().is_none());
        assert_eq!(store.generation(), 2);
    }

    #[test]
    fn test_take() {
        let store = CredentialStore::new();
        store.set_session(Credential::new("T1"), user());

        assert_eq!(store.take().unwrap().expose(), "T1");
        assert!(store.take().is_none());
        assert!(store.identity().is_none());
    }
}
