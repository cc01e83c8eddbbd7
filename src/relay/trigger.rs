use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::permission::{PermissionValidator, Requester};
use super::socket::SocketHandle;
use super::{Relay, RelayError};
use crate::model::{Invite, TargetUser, TriggerSession};
use crate::protocol::{TriggerMessage, TriggerPush};

/// A dashboard connection bound to one authenticated session.
pub struct TriggerConnection {
    socket: SocketHandle,
    session: TriggerSession,
    last_accepted: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for TriggerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerConnection")
            .field("target_user", &self.session.target_user)
            .field("client_id", &self.session.client_id)
            .field("invite_id", &self.session.invite_id)
            .finish_non_exhaustive()
    }
}

impl TriggerConnection {
    pub fn new(socket: SocketHandle, session: TriggerSession) -> Self {
        Self {
            socket,
            session,
            last_accepted: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    pub fn session(&self) -> &TriggerSession {
        &self.session
    }

    pub fn target_user(&self) -> &TargetUser {
        &self.session.target_user
    }

    pub fn client_id(&self) -> &str {
        &self.session.client_id
    }

    pub fn invite_id(&self) -> Option<i64> {
        self.session.invite_id
    }

    pub fn requester(&self) -> Requester<'_> {
        Requester::Trigger {
            client_id: &self.session.client_id,
            invite_id: self.session.invite_id,
        }
    }

    /// Permission checks for this trigger against a listener's grants.
    pub fn validator<'a>(&'a self, invites: &'a [Invite]) -> PermissionValidator<'a> {
        PermissionValidator::new(self.requester(), invites)
    }

    pub fn send(&self, push: &TriggerPush) -> bool {
        self.socket.send_json(push)
    }

    /// Rate limit inbound frames. A frame arriving less than `interval` after
    /// the last accepted one is dropped without resetting the clock.
    pub fn accept_frame(&self, interval: Duration) -> bool {
        let now = Instant::now();
        let mut last = self.last_accepted.lock();
        match *last {
            Some(at) if now.duration_since(at) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Send the initial snapshot: everything the listener knows if one is
    /// connected, otherwise just the disconnected status.
    pub fn on_connected(&self, relay: &Relay) -> Result<(), RelayError> {
        match relay.registry().find_listener(self.target_user()) {
            Some(listener) => listener.greet_trigger(relay, self),
            None => {
                self.send(&TriggerPush::status("connected", false));
                Ok(())
            }
        }
    }

    /// Route a parsed batch to the target user's listener. Requests are
    /// dropped while no listener is connected, and denials are silent.
    pub fn handle_batch(&self, relay: &Relay, batch: Vec<TriggerMessage>) -> Result<(), RelayError> {
        for message in batch {
            let Some(listener) = relay.registry().find_listener(self.target_user()) else {
                tracing::debug!(client_id = self.client_id(), "no listener, dropping request");
                continue;
            };
            match message {
                TriggerMessage::Lock(lock) => {
                    listener.trigger_lock(relay, self, &lock)?;
                }
                TriggerMessage::Change(change) => {
                    listener.trigger_change(relay, self, &change)?;
                }
                TriggerMessage::AvatarChange(change) => {
                    listener.change_avatar(relay, self, &change.vrc_uuid)?;
                }
                TriggerMessage::ActivityPing => listener.activity_ping(relay, self),
            }
        }
        Ok(())
    }

    /// Close the socket, drop the registration, and delete the session row.
    /// Safe to call more than once.
    pub fn close(self: &Arc<Self>, relay: &Relay, reason: &str) {
        self.socket.close(reason);
        if relay.registry().unregister_trigger(self) {
            tracing::info!(
                target_user = %self.target_user(),
                client_id = self.client_id(),
                "trigger disconnected"
            );
        }
        if let Err(e) = relay.store().delete_trigger_session(&self.session.token) {
            tracing::error!(error = %e, client_id = self.client_id(), "failed to delete trigger session");
        }
    }
}
