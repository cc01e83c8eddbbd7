//! Connection-oriented core: listener and trigger connections, the registry
//! that pairs them, permission checks, and invite expiration.

pub mod expiration;
pub mod listener;
pub mod permission;
pub mod registry;
pub mod socket;
pub mod trigger;

use std::sync::Arc;

use serde::Deserialize;

use self::expiration::InviteExpirationScheduler;
use self::listener::ListenerConnection;
use self::registry::ConnectionRegistry;
use self::socket::SocketHandle;
use self::trigger::TriggerConnection;
use crate::config::RelayConfig;
use crate::model::{now_millis, Avatar, TargetUser};
use crate::protocol::{AvatarStatus, ProtocolError, TriggerPush};
use crate::store::{Store, StoreError};

// Close reasons sent to clients.
pub const DUPLICATE_LISTENER: &str = "Duplicate listener";
pub const TOO_MANY_CONNECTIONS: &str = "Too many connections";
pub const NO_TRIGGER_SESSION: &str = "No trigger session";
pub const PROTOCOL_OUT_OF_DATE: &str = "Client protocol out of date";
pub const UNEXPECTED_ERROR: &str = "Unexpected error";
pub const MALFORMED_MESSAGE: &str = "Malformed message";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    #[error("too many trigger sessions for {0}")]
    TooManySessions(TargetUser),
}

/// How a trigger session request names its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Invite,
    User,
}

/// Result of minting a trigger session.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerGrant {
    pub token: String,
    pub target_user: TargetUser,
    pub client_id: String,
    /// Avatars the session could switch to, if the user's listener is
    /// connected.
    pub changeable_avatars: Option<Vec<AvatarStatus>>,
}

/// Shared handle to the relay. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    registry: ConnectionRegistry,
    store: Arc<dyn Store>,
    config: Arc<RelayConfig>,
    expirations: InviteExpirationScheduler,
}

impl Relay {
    pub fn new(store: Arc<dyn Store>, config: RelayConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.max_triggers_per_user),
            store,
            config: Arc::new(config),
            expirations: InviteExpirationScheduler::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn expirations(&self) -> &InviteExpirationScheduler {
        &self.expirations
    }

    /// Finish a listener handshake: load its grants, take over the user's
    /// registry slot, apply the avatar selection, announce it to triggers,
    /// and arm invite expirations.
    pub fn connect_listener(
        &self,
        conn: &Arc<ListenerConnection>,
        selection: &str,
    ) -> Result<(), RelayError> {
        conn.load_account(self.store())?;
        if let Some(evicted) = self.registry.register_listener(conn.clone()) {
            evicted.retire();
            // Dashboards drop the old parameter list before the new listener
            // announces its own.
            let cleared = TriggerPush::Parameters { parameters: Vec::new() };
            for trigger in self.registry.triggers_for(conn.target_user()) {
                trigger.send(&cleared);
            }
        }
        conn.select_avatar(self, selection)?;
        conn.activate(self)?;
        self.expirations.schedule_for_listener(self, conn);
        tracing::info!(target_user = %conn.target_user(), "listener connected");
        Ok(())
    }

    /// Resolve a session token and register the trigger. Returns `None`
    /// after closing the socket if the token is unknown or the user is at
    /// the connection cap.
    pub fn connect_trigger(
        &self,
        socket: SocketHandle,
        token: &str,
    ) -> Result<Option<Arc<TriggerConnection>>, RelayError> {
        let Some(session) = self.store.retrieve_trigger_session(token.trim())? else {
            tracing::debug!("unknown trigger session token");
            socket.close(NO_TRIGGER_SESSION);
            return Ok(None);
        };
        let conn = Arc::new(TriggerConnection::new(socket, session));
        if let Err(e) = self.registry.register_trigger(conn.clone()) {
            tracing::warn!(error = %e, client_id = conn.client_id(), "rejecting trigger");
            conn.socket().close(TOO_MANY_CONNECTIONS);
            return Ok(None);
        }
        tracing::info!(
            target_user = %conn.target_user(),
            client_id = conn.client_id(),
            invite_id = ?conn.invite_id(),
            "trigger connected"
        );
        if let Err(e) = conn.on_connected(self) {
            conn.close(self, UNEXPECTED_ERROR);
            return Err(e);
        }
        Ok(Some(conn))
    }

    /// Mint a trigger session for a user name or an invite url.
    pub fn open_trigger_session(
        &self,
        target: &str,
        target_type: TargetType,
        client_id: Option<&str>,
    ) -> Result<TriggerGrant, RelayError> {
        let (target_user, invite) = match target_type {
            TargetType::User => {
                let user = TargetUser::new(target);
                if self.store.user_id(&user)?.is_none() {
                    return Err(RelayError::UnknownTarget(target.to_string()));
                }
                (user, None)
            }
            TargetType::Invite => match self.store.find_invite(target)? {
                Some((invite, user)) if invite.expires.map_or(true, |at| at > now_millis()) => {
                    (user, Some(invite))
                }
                _ => return Err(RelayError::UnknownTarget(target.to_string())),
            },
        };
        if self.store.count_trigger_sessions(&target_user)? >= self.config.max_triggers_per_user {
            return Err(RelayError::TooManySessions(target_user));
        }

        let client_id = client_id
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let token = self.store.insert_trigger_session(
            &client_id,
            &target_user,
            invite.as_ref().map(|inv| inv.id),
        )?;

        let changeable_avatars = self.changeable_avatars(&target_user)?.map(|mut avatars| {
            if let Some(invite) = &invite {
                avatars.retain(|a| invite.grants_avatar(a.id));
            }
            avatars.iter().map(AvatarStatus::from).collect()
        });
        tracing::info!(target_user = %target_user, client_id = %client_id, "trigger session created");
        Ok(TriggerGrant {
            token,
            target_user,
            client_id,
            changeable_avatars,
        })
    }

    /// Avatars the user's connected listener may switch to, or `None` when no
    /// listener is connected.
    pub fn changeable_avatars(&self, target: &TargetUser) -> Result<Option<Vec<Avatar>>, RelayError> {
        match self.registry.find_listener(target) {
            Some(listener) => Ok(Some(listener.changeable_avatars(self.store())?)),
            None => Ok(None),
        }
    }

    /// Drop the connected listener's parameter cache after an edit and push
    /// fresh lists. Returns whether a listener was connected.
    pub fn invalidate_listener_param_cache(&self, target: &TargetUser) -> Result<bool, RelayError> {
        match self.registry.find_listener(target) {
            Some(listener) => {
                listener.invalidate_caches(self)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clear every lock the user's parameters hold.
    pub fn force_unlock_all(&self, user_id: i64, target: &TargetUser) -> Result<(), RelayError> {
        self.store.unlock_all(user_id)?;
        tracing::warn!(target_user = %target, "all parameter locks cleared");
        self.invalidate_listener_param_cache(target)?;
        Ok(())
    }

    /// Reload every connected listener's invites and re-arm expirations.
    pub fn refresh_invites(&self) {
        self.expirations.refresh_all(self);
    }

    /// Stop timers and remove every trigger session.
    pub fn shutdown(&self) {
        self.expirations.cancel_all();
        for listener in self.registry.listeners() {
            listener.close(self, UNEXPECTED_ERROR);
        }
        if let Err(e) = self.store.delete_all_trigger_sessions() {
            tracing::error!(error = %e, "failed to delete trigger sessions on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::listener::ListenerPhase;
    use super::socket::Outbound;
    use super::*;
    use crate::model::ParamValue;
    use crate::protocol::{parse_trigger_batch, ListenerUpdate};
    use crate::store::MemoryStore;

    const FIXTURE: &str = r#"
        [[users]]
        name = "alice"
        listenKey = "secret"

        [users.settings]
        avatarChangeCooldown = 10

        [[users.avatars]]
        id = 10
        vrcUuid = "avtr_one"
        name = "Avatar1"
        allowChange = true

        [[users.avatars.parameters]]
        id = 100
        name = "Speed"
        type = 2
        dataType = 3
        lockable = true

        [[users.avatars.parameters]]
        id = 101
        name = "Outfit"
        type = 1
        dataType = 1
        values = [
            { value = "0" },
            { value = "1", requiresInvite = true },
        ]

        [[users.avatars.parameters]]
        id = 102
        name = "Secret"
        type = 2
        dataType = 3
        requiresInvite = true

        [[users.avatars.parameters]]
        id = 103
        name = "Jump"
        type = 4
        dataType = 3
        defaultValue = "false"
        maxValue = "200"

        [[users.avatars.parameters]]
        id = 104
        name = "Temp"
        type = 2
        dataType = 3
        saved = false

        [[users.avatars]]
        id = 11
        vrcUuid = "avtr_two"
        name = "Avatar2"
        allowChange = true

        [[users.avatars.parameters]]
        id = 200
        name = "Speed"
        type = 2
        dataType = 3

        [[users.avatars]]
        id = 12
        vrcUuid = "avtr_three"
        name = "Avatar3"

        [[users.invites]]
        id = 500
        url = "invite01"
        parameterIds = [102]
        changeableAvatarIds = [10, 11]
    "#;

    struct Harness {
        relay: Relay,
        store: Arc<MemoryStore>,
        user_id: i64,
    }

    fn harness_with(config: RelayConfig) -> Harness {
        let store = Arc::new(MemoryStore::from_fixture_str(FIXTURE).unwrap());
        let user_id = store.user_id(&alice()).unwrap().unwrap();
        let relay = Relay::new(store.clone(), config);
        Harness { relay, store, user_id }
    }

    fn harness() -> Harness {
        harness_with(RelayConfig::default())
    }

    fn alice() -> TargetUser {
        TargetUser::new("alice")
    }

    fn connect_listener(h: &Harness) -> (Arc<ListenerConnection>, UnboundedReceiver<Outbound>) {
        let (socket, rx) = SocketHandle::new();
        let conn = ListenerConnection::new(socket, alice(), h.user_id);
        h.relay.connect_listener(&conn, "Avatar1").unwrap();
        (conn, rx)
    }

    fn connect_trigger(
        h: &Harness,
        client_id: &str,
        invite_id: Option<i64>,
    ) -> (Arc<TriggerConnection>, UnboundedReceiver<Outbound>) {
        let token = h.store.insert_trigger_session(client_id, &alice(), invite_id).unwrap();
        let (socket, rx) = SocketHandle::new();
        let conn = h.relay.connect_trigger(socket, &token).unwrap().unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Outbound::Text(text) => out.push(serde_json::from_str(&text).unwrap()),
                Outbound::Close(reason) => out.push(json!({ "close": reason })),
            }
        }
        out
    }

    fn of_type<'a>(msgs: &'a [Value], ty: &str) -> Vec<&'a Value> {
        msgs.iter().filter(|m| m["type"] == ty).collect()
    }

    fn param_names(push: &Value) -> Vec<String> {
        push["parameters"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap().to_string())
            .collect()
    }

    fn update(name: &str, value: Value) -> ListenerUpdate {
        ListenerUpdate { name: name.to_string(), value }
    }

    fn send(relay: &Relay, trigger: &TriggerConnection, batch: &str) {
        trigger.handle_batch(relay, parse_trigger_batch(batch).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn waiting_trigger_sees_listener_arrive() {
        let h = harness();
        let (_t, mut trx) = connect_trigger(&h, "c1", None);
        let before = drain(&mut trx);
        assert!(before.contains(&json!({"type": "status", "status": {"connected": false}})));

        let (_l, _lrx) = connect_listener(&h);
        let msgs = drain(&mut trx);
        let full = of_type(&msgs, "full-status");
        assert_eq!(full[0]["status"]["avatar"]["name"], "Avatar1");
        let params = of_type(&msgs, "parameters");
        let names = param_names(params.last().unwrap());
        assert_eq!(names, vec!["Speed", "Outfit", "Jump", "Temp"]);
        assert!(msgs.contains(&json!({"type": "status", "status": {"connected": true}})));
    }

    #[tokio::test]
    async fn late_trigger_gets_snapshot() {
        let h = harness();
        let (listener, mut lrx) = connect_listener(&h);
        listener
            .handle_updates(&h.relay, &[update("/avatar/parameters/Speed", json!(true))])
            .unwrap();
        let (_t, mut trx) = connect_trigger(&h, "c1", None);

        let msgs = drain(&mut trx);
        assert_eq!(msgs[0]["type"], "parameters");
        assert_eq!(msgs[1], json!({"type": "status", "status": {"connected": true}}));
        assert_eq!(msgs[2]["type"], "full-status");
        assert!(msgs.contains(&json!({"type": "parameter-value", "name": "Speed", "value": true})));
        assert!(!of_type(&msgs, "changeable-avatars").is_empty());
        // The greeting also pings the listener for activity.
        assert!(drain(&mut lrx)
            .iter()
            .any(|m| m["parameter"]["name"] == "chat-paramvr-activity"));
    }

    #[tokio::test]
    async fn telemetry_updates_overlay_and_triggers() {
        let h = harness();
        let (listener, _lrx) = connect_listener(&h);
        let (_t, mut trx) = connect_trigger(&h, "c1", None);
        drain(&mut trx);

        listener
            .handle_updates(
                &h.relay,
                &[
                    update("/avatar/parameters/Speed", json!(true)),
                    update("/avatar/parameters/Nope", json!(1)),
                    update("/avatar/parameters/MuteSelf", json!(true)),
                ],
            )
            .unwrap();
        assert_eq!(listener.mutated_value("Speed"), Some(ParamValue::Bool(true)));
        assert_eq!(listener.mutated_value("Nope"), None);

        let msgs = drain(&mut trx);
        assert!(msgs.contains(&json!({"type": "parameter-value", "name": "Speed", "value": true})));
        assert!(msgs.contains(&json!({"type": "status", "status": {"muted": true}})));

        listener
            .handle_updates(&h.relay, &[update("/avatar/parameters/Speed", json!("maybe"))])
            .unwrap();
        assert_eq!(listener.mutated_value("Speed"), Some(ParamValue::Bool(true)));
        assert!(drain(&mut trx).is_empty());
    }

    #[tokio::test]
    async fn trigger_change_reaches_listener() {
        let h = harness();
        let (_listener, mut lrx) = connect_listener(&h);
        let (t, _trx) = connect_trigger(&h, "c1", None);
        drain(&mut lrx);

        send(&h.relay, &t, r#"[{"change": {"name": "Speed", "value": "true"}}]"#);
        assert_eq!(
            drain(&mut lrx),
            vec![json!({"name": "Speed", "value": "true", "dataType": 3})]
        );

        // Wrong type, invite-only parameter, unknown parameter: all dropped.
        send(
            &h.relay,
            &t,
            r#"[
                {"change": {"name": "Speed", "value": "maybe"}},
                {"change": {"name": "Secret", "value": "true"}},
                {"change": {"name": "Missing", "value": "1"}}
            ]"#,
        );
        assert!(drain(&mut lrx).is_empty());
    }

    #[tokio::test]
    async fn lock_excludes_other_clients() {
        let h = harness();
        let (_listener, mut lrx) = connect_listener(&h);
        let (holder, mut hrx) = connect_trigger(&h, "c1", None);
        let (other, mut orx) = connect_trigger(&h, "c2", None);
        drain(&mut lrx);
        drain(&mut hrx);
        drain(&mut orx);

        send(&h.relay, &holder, r#"[{"lock": {"name": "Speed", "locked": true}}]"#);
        assert!(drain(&mut hrx).contains(
            &json!({"type": "parameter-lock", "name": "Speed", "locked": true, "lockKey": "c1"})
        ));
        assert!(drain(&mut orx)
            .contains(&json!({"type": "parameter-lock", "name": "Speed", "locked": true})));

        send(&h.relay, &other, r#"[{"change": {"name": "Speed", "value": "true"}}]"#);
        send(&h.relay, &other, r#"[{"lock": {"name": "Speed", "locked": false}}]"#);
        assert!(drain(&mut lrx).is_empty());
        assert!(drain(&mut orx).is_empty());

        send(&h.relay, &holder, r#"[{"change": {"name": "Speed", "value": "false"}}]"#);
        assert_eq!(drain(&mut lrx).len(), 1);

        send(&h.relay, &holder, r#"[{"lock": {"name": "Speed", "locked": false}}]"#);
        assert!(drain(&mut orx)
            .contains(&json!({"type": "parameter-lock", "name": "Speed", "locked": false})));
    }

    #[tokio::test]
    async fn locks_on_unlockable_parameters_are_refused() {
        let h = harness();
        let (_listener, _lrx) = connect_listener(&h);
        let (t, mut trx) = connect_trigger(&h, "c1", None);
        drain(&mut trx);
        send(&h.relay, &t, r#"[{"lock": {"name": "Temp", "locked": true}}]"#);
        assert!(drain(&mut trx).is_empty());
        let params = h.store.retrieve_parameters(h.user_id, Some("avtr_one")).unwrap();
        assert!(params.iter().all(|p| p.locked_by.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn button_releases_after_hold() {
        let h = harness();
        let (listener, mut lrx) = connect_listener(&h);
        let (t, _trx) = connect_trigger(&h, "c1", None);
        drain(&mut lrx);

        send(&h.relay, &t, r#"[{"change": {"name": "Jump", "value": "true"}}]"#);
        assert_eq!(
            drain(&mut lrx),
            vec![json!({"name": "Jump", "value": "true", "dataType": 3})]
        );
        assert_eq!(listener.pending_button_timers(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            drain(&mut lrx),
            vec![json!({"name": "Jump", "value": "false", "dataType": 3})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retrigger_replaces_pending_release() {
        let h = harness();
        let (_listener, mut lrx) = connect_listener(&h);
        let (t, _trx) = connect_trigger(&h, "c1", None);
        let press = r#"[{"change": {"name": "Jump", "value": "true"}}]"#;
        let release = json!({"name": "Jump", "value": "false", "dataType": 3});

        send(&h.relay, &t, press);
        tokio::time::sleep(Duration::from_millis(150)).await;
        send(&h.relay, &t, press);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!drain(&mut lrx).contains(&release));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let releases = drain(&mut lrx).into_iter().filter(|m| *m == release).count();
        assert_eq!(releases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_listener_cancels_button_release() {
        let h = harness();
        let (listener, mut lrx) = connect_listener(&h);
        let (t, _trx) = connect_trigger(&h, "c1", None);
        send(&h.relay, &t, r#"[{"change": {"name": "Jump", "value": "true"}}]"#);
        listener.close(&h.relay, "bye");
        drain(&mut lrx);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(drain(&mut lrx).is_empty());
    }

    #[tokio::test]
    async fn gated_values_need_an_invite() {
        let h = harness();
        let (listener, _lrx) = connect_listener(&h);
        let (_open, mut open_rx) = connect_trigger(&h, "c1", None);
        let (_invited, mut invited_rx) = connect_trigger(&h, "c2", Some(500));

        let invited_params = of_type(&drain(&mut invited_rx), "parameters")
            .last()
            .map(|p| param_names(p))
            .unwrap();
        assert!(invited_params.contains(&"Secret".to_string()));
        let open_params = of_type(&drain(&mut open_rx), "parameters")
            .last()
            .map(|p| param_names(p))
            .unwrap();
        assert!(!open_params.contains(&"Secret".to_string()));

        listener
            .handle_updates(&h.relay, &[update("/avatar/parameters/Outfit", json!(1))])
            .unwrap();
        let value = json!({"type": "parameter-value", "name": "Outfit", "value": 1});
        assert!(drain(&mut invited_rx).contains(&value));
        assert!(drain(&mut open_rx).is_empty());

        listener
            .handle_updates(&h.relay, &[update("/avatar/parameters/Outfit", json!(0))])
            .unwrap();
        assert_eq!(drain(&mut open_rx).len(), 1);
    }

    #[tokio::test]
    async fn avatar_change_rules() {
        let h = harness();
        let (listener, mut lrx) = connect_listener(&h);
        let (t, mut trx) = connect_trigger(&h, "c1", None);
        drain(&mut lrx);
        drain(&mut trx);

        // Not marked changeable.
        send(&h.relay, &t, r#"[{"avatarChange": {"vrcUuid": "avtr_three"}}]"#);
        assert!(drain(&mut lrx).is_empty());

        send(&h.relay, &t, r#"[{"avatarChange": {"vrcUuid": "avtr_two"}}]"#);
        assert_eq!(drain(&mut lrx), vec![json!({"vrcUuid": "avtr_two"})]);
        assert_eq!(listener.avatar().unwrap().name, "Avatar2");
        let msgs = drain(&mut trx);
        let full = of_type(&msgs, "full-status");
        assert_eq!(full[0]["status"]["avatar"]["name"], "Avatar2");
        assert!(full[0]["status"]["avatarChangeCooldown"].as_i64().unwrap() > 0);

        // Cooldown of ten seconds has not elapsed.
        send(&h.relay, &t, r#"[{"avatarChange": {"vrcUuid": "avtr_one"}}]"#);
        assert!(drain(&mut lrx).is_empty());
    }

    #[tokio::test]
    async fn avatar_switch_prunes_unsaved_values() {
        let h = harness();
        let (listener, _lrx) = connect_listener(&h);
        let (_t, mut trx) = connect_trigger(&h, "c1", None);
        listener
            .handle_updates(
                &h.relay,
                &[
                    update("/avatar/parameters/Temp", json!(true)),
                    update("/avatar/parameters/Speed", json!(true)),
                ],
            )
            .unwrap();
        drain(&mut trx);

        listener
            .handle_updates(&h.relay, &[update("/avatar/change", json!("avtr_two"))])
            .unwrap();
        assert_eq!(listener.mutated_value("Temp"), None);
        assert_eq!(listener.mutated_value("Speed"), Some(ParamValue::Bool(true)));
        assert_eq!(listener.avatar().unwrap().name, "Avatar2");

        let msgs = drain(&mut trx);
        assert!(msgs.contains(&json!({"type": "status", "status": {"vrcOpen": true}})));
        let params = of_type(&msgs, "parameters");
        assert_eq!(param_names(params.last().unwrap()), vec!["Speed"]);
    }

    #[tokio::test]
    async fn closed_game_hides_parameters() {
        let h = harness();
        let (listener, _lrx) = connect_listener(&h);
        let (_t, mut trx) = connect_trigger(&h, "c1", None);
        drain(&mut trx);

        listener
            .handle_updates(&h.relay, &[update("/chat/paramvr/vrcOpen", json!(false))])
            .unwrap();
        let msgs = drain(&mut trx);
        assert!(msgs.contains(&json!({"type": "status", "status": {"vrcOpen": false}})));
        assert!(msgs.contains(&json!({"type": "parameters", "parameters": []})));

        let (_late, mut late_rx) = connect_trigger(&h, "c2", None);
        let late = drain(&mut late_rx);
        assert_eq!(late[0], json!({"type": "parameters", "parameters": []}));
    }

    #[tokio::test]
    async fn listener_close_clears_dashboards() {
        let h = harness();
        let (listener, mut lrx) = connect_listener(&h);
        let (_t, mut trx) = connect_trigger(&h, "c1", None);
        drain(&mut trx);
        drain(&mut lrx);

        listener.close(&h.relay, "bye");
        listener.close(&h.relay, "again");
        assert_eq!(listener.phase(), ListenerPhase::Closed);
        assert!(h.relay.registry().find_listener(&alice()).is_none());
        assert_eq!(drain(&mut lrx), vec![json!({"close": "bye"})]);
        assert_eq!(
            drain(&mut trx),
            vec![
                json!({"type": "parameters", "parameters": []}),
                json!({"type": "status", "status": {"connected": false}}),
            ]
        );
    }

    #[tokio::test]
    async fn eviction_keeps_dashboards_connected() {
        let h = harness();
        let (first, mut first_rx) = connect_listener(&h);
        let (_t, mut trx) = connect_trigger(&h, "c1", None);
        drain(&mut trx);
        drain(&mut first_rx);

        let (second, _second_rx) = connect_listener(&h);
        assert_eq!(first.phase(), ListenerPhase::Closed);
        assert_eq!(drain(&mut first_rx), vec![json!({"close": DUPLICATE_LISTENER})]);
        let found = h.relay.registry().find_listener(&alice()).unwrap();
        assert!(Arc::ptr_eq(&found, &second));

        let msgs = drain(&mut trx);
        assert_eq!(msgs[0], json!({"type": "parameters", "parameters": []}));
        let params = of_type(&msgs, "parameters");
        assert_eq!(params.len(), 2);
        assert!(!param_names(params[1]).is_empty());

        first.close(&h.relay, "late");
        let msgs = drain(&mut trx);
        assert!(!msgs.contains(&json!({"type": "status", "status": {"connected": false}})));
        assert!(h.relay.registry().find_listener(&alice()).is_some());
    }

    #[tokio::test]
    async fn eviction_clears_parameters_when_new_avatar_is_unknown() {
        let h = harness();
        let (_first, mut first_rx) = connect_listener(&h);
        let (_t, mut trx) = connect_trigger(&h, "c1", None);
        drain(&mut trx);
        drain(&mut first_rx);

        let (socket, _second_rx) = SocketHandle::new();
        let second = ListenerConnection::new(socket, alice(), h.user_id);
        h.relay.connect_listener(&second, "Nope").unwrap();

        let msgs = drain(&mut trx);
        assert_eq!(msgs[0], json!({"type": "parameters", "parameters": []}));
        assert!(of_type(&msgs, "parameters")
            .iter()
            .all(|p| p["parameters"].as_array().unwrap().is_empty()));
    }

    #[tokio::test]
    async fn activity_ping_reports_and_throttles() {
        let h = harness();
        let (listener, mut lrx) = connect_listener(&h);
        let (t, mut trx) = connect_trigger(&h, "c1", None);
        drain(&mut lrx);
        drain(&mut trx);

        send(&h.relay, &t, r#"[{"ping": true}]"#);
        assert_eq!(
            drain(&mut trx),
            vec![json!({"type": "status", "status": {"active": false}})]
        );
        // Pinged during the greeting, so not again yet.
        assert!(drain(&mut lrx).is_empty());

        listener
            .handle_updates(
                &h.relay,
                &[update("/chat/paramvr/lastActivity", json!(now_millis()))],
            )
            .unwrap();
        send(&h.relay, &t, r#"[{"change": {"name": "chat-paramvr-activity", "value": ""}}]"#);
        assert_eq!(
            drain(&mut trx),
            vec![json!({"type": "status", "status": {"active": true}})]
        );
    }

    #[tokio::test]
    async fn unknown_token_is_refused() {
        let h = harness();
        let (socket, mut rx) = SocketHandle::new();
        assert!(h.relay.connect_trigger(socket, "nope").unwrap().is_none());
        assert_eq!(drain(&mut rx), vec![json!({"close": NO_TRIGGER_SESSION})]);
    }

    #[tokio::test]
    async fn trigger_cap_closes_extra_connection() {
        let h = harness_with(RelayConfig {
            max_triggers_per_user: 1,
            ..RelayConfig::default()
        });
        let (_first, _rx) = connect_trigger(&h, "c1", None);
        let token = h.store.insert_trigger_session("c2", &alice(), None).unwrap();
        let (socket, mut rx) = SocketHandle::new();
        assert!(h.relay.connect_trigger(socket, &token).unwrap().is_none());
        assert_eq!(drain(&mut rx), vec![json!({"close": TOO_MANY_CONNECTIONS})]);
        assert_eq!(h.relay.registry().count_triggers(&alice()), 1);
    }

    #[tokio::test]
    async fn trigger_close_deletes_session() {
        let h = harness();
        let (t, _rx) = connect_trigger(&h, "c1", None);
        let token = t.session().token.clone();
        t.close(&h.relay, "bye");
        t.close(&h.relay, "bye");
        assert!(h.store.retrieve_trigger_session(&token).unwrap().is_none());
        assert_eq!(h.relay.registry().count_triggers(&alice()), 0);
    }

    #[tokio::test]
    async fn open_trigger_session_targets() {
        let h = harness_with(RelayConfig {
            max_triggers_per_user: 2,
            ..RelayConfig::default()
        });

        let by_user = h
            .relay
            .open_trigger_session("Alice", TargetType::User, Some("dash"))
            .unwrap();
        assert_eq!(by_user.target_user, alice());
        assert_eq!(by_user.client_id, "dash");
        assert!(by_user.changeable_avatars.is_none());

        let (_l, _lrx) = connect_listener(&h);
        let by_invite = h
            .relay
            .open_trigger_session("invite01", TargetType::Invite, Some(""))
            .unwrap();
        assert!(!by_invite.client_id.is_empty());
        let session = h.store.retrieve_trigger_session(&by_invite.token).unwrap().unwrap();
        assert_eq!(session.invite_id, Some(500));
        let avatars = by_invite.changeable_avatars.unwrap();
        assert_eq!(avatars.len(), 2);

        assert!(matches!(
            h.relay.open_trigger_session("alice", TargetType::User, None),
            Err(RelayError::TooManySessions(_))
        ));
        assert!(matches!(
            h.relay.open_trigger_session("nobody", TargetType::User, None),
            Err(RelayError::UnknownTarget(_))
        ));
        assert!(matches!(
            h.relay.open_trigger_session("missing", TargetType::Invite, None),
            Err(RelayError::UnknownTarget(_))
        ));
    }

    #[tokio::test]
    async fn force_unlock_repushes_parameters() {
        let h = harness();
        let (_listener, _lrx) = connect_listener(&h);
        let (t, mut trx) = connect_trigger(&h, "c1", None);
        send(&h.relay, &t, r#"[{"lock": {"name": "Speed", "locked": true}}]"#);
        drain(&mut trx);

        h.relay.force_unlock_all(h.user_id, &alice()).unwrap();
        let msgs = drain(&mut trx);
        let params = of_type(&msgs, "parameters");
        let speed = &params.last().unwrap()["parameters"][0];
        assert_eq!(speed["name"], "Speed");
        assert_eq!(speed["locked"], false);
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_error() {
        let h = harness();
        let (listener, _lrx) = connect_listener(&h);
        h.store.set_unavailable(true);
        assert!(matches!(
            listener.invalidate_caches(&h.relay),
            Err(RelayError::Store(_))
        ));
        assert!(matches!(
            listener.handle_updates(&h.relay, &[update("/avatar/parameters/Speed", json!(true))]),
            Err(RelayError::Store(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_invite_is_deleted_and_revoked() {
        let h = harness();
        let invite = h
            .store
            .create_invite(h.user_id, Some(now_millis() + 50), vec![102], vec![]);
        let (listener, _lrx) = connect_listener(&h);
        assert_eq!(h.relay.expirations().scheduled_count(), 1);
        let (_t, mut trx) = connect_trigger(&h, "c1", Some(invite.id));
        let names = param_names(of_type(&drain(&mut trx), "parameters")[0]);
        assert!(names.contains(&"Secret".to_string()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.store.deleted_invites(), vec![invite.url.clone()]);
        assert!(listener.invites().iter().all(|inv| inv.id != invite.id));
        assert_eq!(h.relay.expirations().scheduled_count(), 0);
        let names = param_names(of_type(&drain(&mut trx), "parameters")[0]);
        assert!(!names.contains(&"Secret".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_replaces_pending_expirations() {
        let h = harness();
        h.store
            .create_invite(h.user_id, Some(now_millis() + 60_000), vec![], vec![]);
        let (_listener, _lrx) = connect_listener(&h);
        assert_eq!(h.relay.expirations().scheduled_count(), 1);

        h.store
            .create_invite(h.user_id, Some(now_millis() + 60_000), vec![], vec![]);
        h.relay.refresh_invites();
        assert_eq!(h.relay.expirations().scheduled_count(), 2);

        h.relay.expirations().cancel_all();
        assert_eq!(h.relay.expirations().scheduled_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_removes_trigger_sessions() {
        let h = harness();
        let (_listener, _lrx) = connect_listener(&h);
        let (_t, _trx) = connect_trigger(&h, "c1", None);
        h.relay.shutdown();
        assert_eq!(h.store.trigger_session_total(), 0);
        assert!(h.relay.registry().find_listener(&alice()).is_none());
    }
}
