//! One-shot deletion of time-limited invites.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::listener::ListenerConnection;
use super::Relay;
use crate::model::{now_millis, Invite};

type InviteKey = (i64, String);

struct Scheduled {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerInner {
    tasks: HashMap<InviteKey, Scheduled>,
    next_generation: u64,
}

/// Pending expiration timers keyed by (user id, invite url).
///
/// Each scheduled timer carries a generation number. A timer that fires acts
/// only if its generation still matches the map entry, so a replaced timer
/// neither deletes the invite nor removes its successor.
#[derive(Clone, Default)]
pub struct InviteExpirationScheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl InviteExpirationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `invite`. Invites without an expiry are ignored. An
    /// expiry in the past fires immediately.
    pub fn schedule(&self, relay: &Relay, user_id: i64, invite: &Invite) {
        let Some(expires) = invite.expires else {
            return;
        };
        let delay = Duration::from_millis((expires - now_millis()).max(0) as u64);
        let key: InviteKey = (user_id, invite.url.clone());

        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let scheduler = self.clone();
        let relay = relay.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if scheduler.finish(&task_key, generation) {
                expire_invite(&relay, task_key.0, &task_key.1);
            }
        });
        if let Some(prior) = inner.tasks.insert(key, Scheduled { generation, handle }) {
            prior.handle.abort();
        }
        tracing::debug!(user_id, url = %invite.url, delay_ms = delay.as_millis() as u64, "invite expiration scheduled");
    }

    /// Replace every timer for the listener's user with timers for its
    /// current grant list.
    pub fn schedule_for_listener(&self, relay: &Relay, listener: &ListenerConnection) {
        let user_id = listener.user_id();
        self.cancel_user(user_id);
        for invite in listener.invites() {
            self.schedule(relay, user_id, &invite);
        }
    }

    /// Drop every timer, reload each connected listener's invites, and
    /// schedule them again. A listener whose reload fails is skipped.
    pub fn refresh_all(&self, relay: &Relay) {
        self.cancel_all();
        for listener in relay.registry().listeners() {
            match listener.reload_invites(relay) {
                Ok(invites) => {
                    for invite in &invites {
                        self.schedule(relay, listener.user_id(), invite);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, target_user = %listener.target_user(), "failed to reload invites");
                }
            }
        }
    }

    pub fn cancel_user(&self, user_id: i64) {
        let mut inner = self.inner.lock();
        inner.tasks.retain(|(uid, _), scheduled| {
            if *uid == user_id {
                scheduled.handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock();
        for (_, scheduled) in inner.tasks.drain() {
            scheduled.handle.abort();
        }
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn scheduled_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Remove a fired timer's entry. Returns `false` if the timer was
    /// replaced or cancelled in the meantime.
    fn finish(&self, key: &InviteKey, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.tasks.get(key).is_some_and(|s| s.generation == generation) {
            inner.tasks.remove(key);
            true
        } else {
            false
        }
    }
}

fn expire_invite(relay: &Relay, user_id: i64, url: &str) {
    if let Err(e) = relay.store().delete_invite(user_id, url) {
        tracing::error!(error = %e, user_id, url, "failed to delete expired invite");
        return;
    }
    tracing::info!(user_id, url, "invite expired");

    let listener = relay
        .registry()
        .listeners()
        .into_iter()
        .find(|l| l.user_id() == user_id);
    if let Some(listener) = listener {
        if let Err(e) = listener.reload_invites(relay) {
            tracing::error!(error = %e, target_user = %listener.target_user(), "failed to reload invites after expiry");
        }
    }
}
