use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::listener::ListenerConnection;
use super::trigger::TriggerConnection;
use super::DUPLICATE_LISTENER;
use crate::model::TargetUser;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("too many trigger connections for {0}")]
    TooManyTriggers(TargetUser),
}

struct RegistryInner {
    listeners: HashMap<TargetUser, Arc<ListenerConnection>>,
    triggers: Vec<Arc<TriggerConnection>>,
    max_triggers_per_user: usize,
}

/// Process-wide set of live listener and trigger connections.
///
/// One coarse lock guards both sets. The lock is a leaf: nothing called
/// while it is held takes another lock, and snapshots are handed out so
/// callers can fan out without holding it.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ConnectionRegistry {
    /// Default cap on concurrent trigger connections per target user.
    pub const DEFAULT_MAX_TRIGGERS: usize = 25;

    pub fn new(max_triggers_per_user: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                listeners: HashMap::new(),
                triggers: Vec::new(),
                max_triggers_per_user,
            })),
        }
    }

    /// Register `conn` as the listener for its target user.
    ///
    /// Any listener already registered for that user is closed with a
    /// duplicate reason and replaced in the same critical section, so two
    /// listeners for one user are never visible at once. The evicted
    /// connection is returned for the caller to finish tearing down.
    pub fn register_listener(
        &self,
        conn: Arc<ListenerConnection>,
    ) -> Option<Arc<ListenerConnection>> {
        let target = conn.target_user().clone();
        let mut inner = self.inner.lock();
        let evicted = inner.listeners.insert(target.clone(), conn);
        if let Some(old) = &evicted {
            old.socket().close(DUPLICATE_LISTENER);
            tracing::warn!(target_user = %target, "evicted duplicate listener");
        }
        evicted
    }

    /// Remove `conn` if it is still the registered listener for its user.
    /// Returns whether anything was removed.
    pub fn unregister_listener(&self, conn: &Arc<ListenerConnection>) -> bool {
        let mut inner = self.inner.lock();
        match inner.listeners.get(conn.target_user()) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                inner.listeners.remove(conn.target_user());
                true
            }
            _ => false,
        }
    }

    pub fn find_listener(&self, target: &TargetUser) -> Option<Arc<ListenerConnection>> {
        self.inner.lock().listeners.get(target).cloned()
    }

    /// Snapshot of every registered listener.
    pub fn listeners(&self) -> Vec<Arc<ListenerConnection>> {
        self.inner.lock().listeners.values().cloned().collect()
    }

    /// Register a trigger, refusing it if its user is already at the cap.
    pub fn register_trigger(&self, conn: Arc<TriggerConnection>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let target = conn.target_user();
        let count = inner
            .triggers
            .iter()
            .filter(|t| t.target_user() == target)
            .count();
        if count >= inner.max_triggers_per_user {
            return Err(RegistryError::TooManyTriggers(target.clone()));
        }
        inner.triggers.push(conn);
        Ok(())
    }

    pub fn unregister_trigger(&self, conn: &Arc<TriggerConnection>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.triggers.len();
        inner.triggers.retain(|t| !Arc::ptr_eq(t, conn));
        inner.triggers.len() != before
    }

    /// Snapshot of the triggers watching `target`.
    pub fn triggers_for(&self, target: &TargetUser) -> Vec<Arc<TriggerConnection>> {
        self.inner
            .lock()
            .triggers
            .iter()
            .filter(|t| t.target_user() == target)
            .cloned()
            .collect()
    }

    pub fn count_triggers(&self, target: &TargetUser) -> usize {
        self.inner
            .lock()
            .triggers
            .iter()
            .filter(|t| t.target_user() == target)
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_TRIGGERS)
    }
}
