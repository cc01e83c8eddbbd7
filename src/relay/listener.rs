//! The avatar-side connection: live avatar state, the mutated-parameter
//! overlay, lock echoes, and button auto-release timers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::socket::SocketHandle;
use super::trigger::TriggerConnection;
use super::{Relay, RelayError};
use crate::model::{
    now_millis, Avatar, Invite, ParamValue, Parameter, ParameterType, TargetUser, UserSettings,
};
use crate::protocol::{
    AvatarStatus, ChangeRequest, Colors, ListenerCommand, ListenerStatus, ListenerUpdate,
    ParameterChange, ParameterLock, TriggerPush,
};
use crate::store::{AvatarLookup, Store, StoreError};

const AVATAR_CHANGE_PATH: &str = "/avatar/change";
const MUTE_PATH: &str = "/avatar/parameters/MuteSelf";
const VR_MODE_PATH: &str = "/avatar/parameters/VRMode";
const AFK_PATH: &str = "/avatar/parameters/AFK";
const LAST_ACTIVITY_PATH: &str = "/chat/paramvr/lastActivity";
const VRC_OPEN_PATH: &str = "/chat/paramvr/vrcOpen";

/// Telemetry paths for avatar parameters carry this prefix before the
/// parameter name.
const PARAMETER_PATH_PREFIX: &str = "/avatar/parameters/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    Connecting,
    Active,
    Closed,
}

/// Lazily fetched data that can be dropped and re-fetched on next use.
#[derive(Debug)]
enum Cached<T> {
    Unpopulated,
    Populated(T),
}

impl<T> Cached<T> {
    fn get(&self) -> Option<&T> {
        match self {
            Self::Populated(v) => Some(v),
            Self::Unpopulated => None,
        }
    }

    fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Self::Populated(v) => Some(v),
            Self::Unpopulated => None,
        }
    }

    fn ensure<E>(&mut self, fetch: impl FnOnce() -> Result<T, E>) -> Result<(), E> {
        if let Self::Unpopulated = self {
            *self = Self::Populated(fetch()?);
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        *self = Self::Unpopulated;
    }
}

struct ListenerState {
    phase: ListenerPhase,
    avatar: Option<Avatar>,
    muted: Option<bool>,
    afk: Option<bool>,
    is_pancake: Option<bool>,
    vrc_open: Option<bool>,
    last_activity: Option<i64>,
    last_activity_ping: Option<i64>,
    last_avatar_change: Option<i64>,
    settings: Option<UserSettings>,
    invites: Vec<Invite>,
    /// Last observed value per parameter name. Survives cache invalidation.
    mutated: HashMap<String, ParamValue>,
    params: Cached<Vec<Parameter>>,
    changeable_avatars: Cached<Vec<Avatar>>,
    button_timers: HashMap<String, JoinHandle<()>>,
}

impl ListenerState {
    fn ensure_params(&mut self, store: &dyn Store, user_id: i64) -> Result<(), StoreError> {
        let vrc_uuid = self.avatar.as_ref().map(|a| a.vrc_uuid.clone());
        self.params.ensure(|| {
            let mut params = store.retrieve_parameters(user_id, vrc_uuid.as_deref())?;
            for param in params.iter_mut().filter(|p| p.kind == ParameterType::Lov) {
                param.values = Some(store.retrieve_parameter_values(param.id)?);
            }
            tracing::debug!(count = params.len(), avatar = ?vrc_uuid, "parameter cache populated");
            Ok(params)
        })
    }

    fn params(&self) -> &[Parameter] {
        self.params.get().map(Vec::as_slice).unwrap_or(&[])
    }

    fn find_param(&self, name: &str) -> Option<Parameter> {
        self.params().iter().find(|p| p.name == name).cloned()
    }

    fn ensure_changeable(&mut self, store: &dyn Store, user_id: i64) -> Result<(), StoreError> {
        self.changeable_avatars.ensure(|| {
            let mut avatars = store.retrieve_avatars(user_id)?;
            avatars.retain(|a| a.allow_change);
            Ok(avatars)
        })
    }

    fn changeable(&self) -> &[Avatar] {
        self.changeable_avatars.get().map(Vec::as_slice).unwrap_or(&[])
    }

    fn is_active(&self, now: i64, window_ms: i64) -> bool {
        self.last_activity.is_some_and(|t| now - t < window_ms)
    }

    /// Milliseconds left before another avatar change is allowed.
    fn cooldown_remaining(&self, now: i64) -> i64 {
        let cooldown_ms = self
            .settings
            .as_ref()
            .map(|s| s.avatar_change_cooldown * 1000)
            .unwrap_or(0);
        match self.last_avatar_change {
            Some(last) => (cooldown_ms - (now - last)).max(0),
            None => 0,
        }
    }

    /// `None` is treated as open: parameters are only withheld once the
    /// listener has positively reported the game closed.
    fn parameters_hidden(&self) -> bool {
        self.vrc_open == Some(false)
    }
}

pub struct ListenerConnection {
    socket: SocketHandle,
    target_user: TargetUser,
    user_id: i64,
    state: Mutex<ListenerState>,
}

impl std::fmt::Debug for ListenerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConnection")
            .field("target_user", &self.target_user)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl ListenerConnection {
    pub fn new(socket: SocketHandle, target_user: TargetUser, user_id: i64) -> Arc<Self> {
        Arc::new(Self {
            socket,
            target_user,
            user_id,
            state: Mutex::new(ListenerState {
                phase: ListenerPhase::Connecting,
                avatar: None,
                muted: None,
                afk: None,
                is_pancake: None,
                vrc_open: None,
                last_activity: None,
                last_activity_ping: None,
                last_avatar_change: None,
                settings: None,
                invites: Vec::new(),
                mutated: HashMap::new(),
                params: Cached::Unpopulated,
                changeable_avatars: Cached::Unpopulated,
                button_timers: HashMap::new(),
            }),
        })
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    pub fn target_user(&self) -> &TargetUser {
        &self.target_user
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn phase(&self) -> ListenerPhase {
        self.state.lock().phase
    }

    pub fn avatar(&self) -> Option<Avatar> {
        self.state.lock().avatar.clone()
    }

    pub fn invites(&self) -> Vec<Invite> {
        self.state.lock().invites.clone()
    }

    pub fn mutated_value(&self, name: &str) -> Option<ParamValue> {
        self.state.lock().mutated.get(name).copied()
    }

    pub fn pending_button_timers(&self) -> usize {
        self.state
            .lock()
            .button_timers
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Changeable avatars, fetched on first use.
    pub fn changeable_avatars(&self, store: &dyn Store) -> Result<Vec<Avatar>, StoreError> {
        let mut st = self.state.lock();
        st.ensure_changeable(store, self.user_id)?;
        Ok(st.changeable().to_vec())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Pull settings and invite grants from storage. Runs before the
    /// connection is registered.
    pub fn load_account(&self, store: &dyn Store) -> Result<(), StoreError> {
        let settings = store.retrieve_settings(self.user_id)?;
        let invites = store.retrieve_minimal_invites(self.user_id)?;
        let mut st = self.state.lock();
        st.settings = settings;
        st.invites = invites;
        Ok(())
    }

    /// Apply the listener's avatar-selection frame: a name, or an external
    /// id with the `avtr_` prefix.
    pub fn select_avatar(&self, relay: &Relay, selection: &str) -> Result<(), RelayError> {
        let avatar = relay
            .store()
            .retrieve_avatar(self.user_id, AvatarLookup::parse(selection))?;
        tracing::info!(target_user = %self.target_user, avatar = ?avatar.as_ref().map(|a| &a.name), "avatar selected");
        let mut st = self.state.lock();
        st.avatar = avatar;
        if st.avatar.is_some() {
            self.avatar_changed(&mut st, relay)?;
        }
        Ok(())
    }

    /// Move to `Active` and tell every watching trigger the listener is here.
    pub fn activate(&self, relay: &Relay) -> Result<(), RelayError> {
        let mut st = self.state.lock();
        if st.phase != ListenerPhase::Connecting {
            return Ok(());
        }
        st.phase = ListenerPhase::Active;
        self.push_all(relay, &TriggerPush::status("connected", true));
        st.ensure_params(relay.store(), self.user_id)?;
        st.ensure_changeable(relay.store(), self.user_id)?;
        for trigger in relay.registry().triggers_for(&self.target_user) {
            self.send_locked_params(&st, &trigger);
            self.send_changeable_avatars(&st, &trigger);
        }
        Ok(())
    }

    /// Tear down after eviction by a newer listener. The registry already
    /// closed the socket and dropped the registration.
    pub fn retire(&self) {
        let timers = {
            let mut st = self.state.lock();
            st.phase = ListenerPhase::Closed;
            std::mem::take(&mut st.button_timers)
        };
        for (_, timer) in timers {
            timer.abort();
        }
    }

    /// Close the connection. Idempotent. Only a listener that was still
    /// registered clears the dashboards; an evicted one leaves that to its
    /// replacement.
    pub fn close(self: &Arc<Self>, relay: &Relay, reason: &str) {
        {
            let st = self.state.lock();
            if st.phase == ListenerPhase::Closed {
                return;
            }
        }
        self.retire();
        self.socket.close(reason);
        if relay.registry().unregister_listener(self) {
            let cleared = TriggerPush::Parameters { parameters: Vec::new() };
            let disconnected = TriggerPush::status("connected", false);
            for trigger in relay.registry().triggers_for(&self.target_user) {
                trigger.send(&cleared);
                trigger.send(&disconnected);
            }
            tracing::info!(target_user = %self.target_user, reason, "listener closed");
        }
    }

    // ── Telemetry ──────────────────────────────────────────────────

    /// Apply one telemetry batch. An avatar change anywhere in the batch is
    /// applied first so the remaining updates resolve against the new
    /// avatar's parameters.
    pub fn handle_updates(&self, relay: &Relay, updates: &[ListenerUpdate]) -> Result<(), RelayError> {
        let mut st = self.state.lock();
        if st.phase == ListenerPhase::Closed {
            return Ok(());
        }
        let avatar_change = updates
            .iter()
            .find(|u| u.name == AVATAR_CHANGE_PATH)
            .and_then(|u| u.value.as_str());
        tracing::debug!(
            target_user = %self.target_user,
            count = updates.len(),
            avatar_changed = avatar_change.is_some(),
            "handling listener updates"
        );
        if let Some(vrc_uuid) = avatar_change {
            st.is_pancake = Some(true);
            st.avatar = relay
                .store()
                .retrieve_avatar(self.user_id, AvatarLookup::VrcUuid(vrc_uuid))?;
            if st.vrc_open != Some(true) {
                st.vrc_open = Some(true);
                self.push_all(relay, &TriggerPush::status("vrcOpen", true));
            }
            self.avatar_changed(&mut st, relay)?;
        }
        for update in updates {
            self.apply_update(&mut st, relay, update)?;
        }
        Ok(())
    }

    fn apply_update(
        &self,
        st: &mut ListenerState,
        relay: &Relay,
        update: &ListenerUpdate,
    ) -> Result<(), RelayError> {
        match update.name.as_str() {
            AVATAR_CHANGE_PATH => {}
            MUTE_PATH => {
                if let Some(muted) = update.value.as_bool() {
                    st.muted = Some(muted);
                    self.push_all(relay, &TriggerPush::status("muted", muted));
                }
            }
            VR_MODE_PATH => {
                st.is_pancake = Some(false);
                self.push_all(relay, &TriggerPush::status("isPancake", false));
            }
            AFK_PATH => {
                if let Some(afk) = update.value.as_bool() {
                    st.afk = Some(afk);
                    self.push_all(relay, &TriggerPush::status("afk", afk));
                }
            }
            LAST_ACTIVITY_PATH => {
                if let Some(at) = update.value.as_i64() {
                    st.last_activity = Some(at);
                }
            }
            VRC_OPEN_PATH => {
                if let Some(open) = update.value.as_bool() {
                    if st.vrc_open != Some(open) {
                        st.vrc_open = Some(open);
                        self.push_all(relay, &TriggerPush::status("vrcOpen", open));
                        self.push_parameters(st, relay)?;
                        self.push_changeable_avatars(st, relay)?;
                    }
                }
            }
            path => {
                let Some(name) = path.strip_prefix(PARAMETER_PATH_PREFIX) else {
                    tracing::debug!(target_user = %self.target_user, path, "ignoring unknown path");
                    return Ok(());
                };
                st.ensure_params(relay.store(), self.user_id)?;
                let Some(param) = st.find_param(name) else {
                    tracing::debug!(target_user = %self.target_user, parameter = name, "unknown parameter");
                    return Ok(());
                };
                let Some(value) = ParamValue::coerce(&update.value, param.data_type) else {
                    tracing::debug!(
                        target_user = %self.target_user,
                        parameter = name,
                        value = %update.value,
                        "dropping value that does not fit the data type"
                    );
                    return Ok(());
                };
                st.mutated.insert(param.name.clone(), value);
                let push = TriggerPush::ParameterValue {
                    name: param.name.clone(),
                    value,
                };
                for trigger in relay.registry().triggers_for(&self.target_user) {
                    if trigger.validator(&st.invites).can_view_value(&param, &value) {
                        trigger.send(&push);
                    }
                }
            }
        }
        Ok(())
    }

    // ── Trigger requests ───────────────────────────────────────────

    /// Forward a validated change to the listener. BUTTON parameters also
    /// get an auto-release scheduled. Returns whether the change went out.
    pub fn trigger_change(
        self: &Arc<Self>,
        relay: &Relay,
        trigger: &TriggerConnection,
        change: &ChangeRequest,
    ) -> Result<bool, RelayError> {
        let mut st = self.state.lock();
        st.ensure_params(relay.store(), self.user_id)?;
        let Some(param) = st.find_param(&change.name) else {
            tracing::debug!(client_id = trigger.client_id(), parameter = %change.name, "change for unknown parameter");
            return Ok(false);
        };
        let raw = serde_json::Value::String(change.value.clone());
        let permitted = ParamValue::coerce(&raw, param.data_type)
            .is_some_and(|value| trigger.validator(&st.invites).can_modify_value(&param, &value));
        if !permitted {
            tracing::debug!(client_id = trigger.client_id(), parameter = %param.name, "change not permitted");
            return Ok(false);
        }

        tracing::debug!(target_user = %self.target_user, parameter = %param.name, value = %change.value, "forwarding change");
        self.socket.send_json(&ListenerCommand::Change(ParameterChange {
            name: param.name.clone(),
            value: change.value.clone(),
            data_type: param.data_type,
        }));
        if param.kind == ParameterType::Button {
            self.schedule_button_release(&mut st, &param);
        }
        Ok(true)
    }

    /// Last trigger wins: a pending release for the same button is aborted
    /// and replaced.
    fn schedule_button_release(self: &Arc<Self>, st: &mut ListenerState, param: &Parameter) {
        if let Some(prior) = st.button_timers.remove(&param.name) {
            if !prior.is_finished() {
                tracing::debug!(parameter = %param.name, "replacing pending button release");
            }
            prior.abort();
        }
        let Some(release) = param.default_value.clone() else {
            return;
        };
        let hold = param.max_hold().unwrap_or_else(|| {
            tracing::warn!(parameter = %param.name, max_value = ?param.max_value, "invalid button hold time");
            Duration::ZERO
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let name = param.name.clone();
        let data_type = param.data_type;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if conn.phase() == ListenerPhase::Closed {
                return;
            }
            tracing::debug!(target_user = %conn.target_user, parameter = %name, "button reached max press time");
            conn.socket.send_json(&ListenerCommand::Change(ParameterChange {
                name,
                value: release,
                data_type,
            }));
        });
        st.button_timers.insert(param.name.clone(), handle);
    }

    /// Acquire or release a parameter lock for `trigger` and echo the new
    /// state to every trigger allowed to see the parameter.
    pub fn trigger_lock(
        &self,
        relay: &Relay,
        trigger: &TriggerConnection,
        lock: &ParameterLock,
    ) -> Result<bool, RelayError> {
        let mut st = self.state.lock();
        st.ensure_params(relay.store(), self.user_id)?;
        let Some(param) = st.find_param(&lock.name) else {
            return Ok(false);
        };
        if !trigger.validator(&st.invites).can_lock(&param, lock.locked) {
            tracing::debug!(client_id = trigger.client_id(), parameter = %param.name, "lock not permitted");
            return Ok(false);
        }
        let changed = relay.store().set_parameter_lock(
            self.user_id,
            param.id,
            lock.locked,
            trigger.client_id(),
            trigger.invite_id(),
        )?;
        if !changed {
            tracing::debug!(client_id = trigger.client_id(), parameter = %param.name, "lock row unchanged");
            return Ok(false);
        }

        let holder = lock.locked.then(|| trigger.client_id().to_string());
        if let Some(cached) = st
            .params
            .get_mut()
            .and_then(|params| params.iter_mut().find(|p| p.id == param.id))
        {
            cached.locked_by = holder.clone();
        }
        let mut updated = param;
        updated.locked_by = holder;
        tracing::info!(target_user = %self.target_user, parameter = %updated.name, locked = lock.locked, "lock changed");

        for other in relay.registry().triggers_for(&self.target_user) {
            if other.validator(&st.invites).can_view(&updated) {
                let lock_key = (other.client_id() == trigger.client_id())
                    .then(|| trigger.client_id().to_string());
                other.send(&TriggerPush::ParameterLock {
                    name: updated.name.clone(),
                    locked: lock.locked,
                    lock_key,
                });
            }
        }
        Ok(true)
    }

    /// Switch avatars on behalf of `trigger`. Requires permission on the
    /// current avatar, a current avatar that allows changes, a target in the
    /// changeable set, and an elapsed cooldown.
    pub fn change_avatar(
        &self,
        relay: &Relay,
        trigger: &TriggerConnection,
        vrc_uuid: &str,
    ) -> Result<bool, RelayError> {
        let mut st = self.state.lock();
        let Some(target) = relay
            .store()
            .retrieve_avatar(self.user_id, AvatarLookup::VrcUuid(vrc_uuid))?
        else {
            return Ok(false);
        };
        st.ensure_changeable(relay.store(), self.user_id)?;
        let now = now_millis();
        let current_allows = st.avatar.as_ref().is_some_and(|a| a.allow_change);
        let changeable = st.changeable().iter().any(|a| a.id == target.id);
        let permitted = trigger
            .validator(&st.invites)
            .can_change_avatar(st.avatar.as_ref(), &target);
        let cooled_down = st.cooldown_remaining(now) == 0;
        if !(current_allows && changeable && permitted && cooled_down) {
            tracing::debug!(
                client_id = trigger.client_id(),
                avatar = vrc_uuid,
                current_allows,
                changeable,
                permitted,
                cooled_down,
                "avatar change rejected"
            );
            return Ok(false);
        }

        tracing::info!(target_user = %self.target_user, avatar = %target.name, "changing avatar");
        self.socket.send_json(&ListenerCommand::AvatarChange {
            vrc_uuid: target.vrc_uuid.clone(),
        });
        st.last_avatar_change = Some(now);
        st.is_pancake = Some(true);
        st.avatar = Some(target);
        self.avatar_changed(&mut st, relay)?;
        Ok(true)
    }

    /// Answer a trigger's activity ping, and ping the listener if it has
    /// not been pinged recently.
    pub fn activity_ping(&self, relay: &Relay, trigger: &TriggerConnection) {
        let mut st = self.state.lock();
        self.activity_check(&mut st, relay, trigger);
    }

    fn activity_check(&self, st: &mut ListenerState, relay: &Relay, trigger: &TriggerConnection) {
        let now = now_millis();
        let config = relay.config();
        trigger.send(&TriggerPush::status(
            "active",
            st.is_active(now, config.activity_window_ms),
        ));
        let due = st
            .last_activity_ping
            .map_or(true, |last| now - last > config.activity_ping_interval_ms);
        if due {
            st.last_activity_ping = Some(now);
            tracing::debug!(target_user = %self.target_user, "pinging listener activity");
            self.socket.send_json(&ListenerCommand::activity_ping());
        }
    }

    /// Everything a freshly connected trigger needs, in order: parameters,
    /// connection status, full status, mutated values, locks, changeable
    /// avatars, and an activity check.
    pub fn greet_trigger(&self, relay: &Relay, trigger: &TriggerConnection) -> Result<(), RelayError> {
        let mut st = self.state.lock();
        st.ensure_params(relay.store(), self.user_id)?;
        st.ensure_changeable(relay.store(), self.user_id)?;

        trigger.send(&self.parameters_for(&st, trigger));
        trigger.send(&TriggerPush::status("connected", true));
        trigger.send(&TriggerPush::FullStatus {
            status: self.status(&st, relay),
        });
        if !st.parameters_hidden() {
            let validator = trigger.validator(&st.invites);
            for param in st.params() {
                if let Some(value) = st.mutated.get(&param.name) {
                    if validator.can_view_value(param, value) {
                        trigger.send(&TriggerPush::ParameterValue {
                            name: param.name.clone(),
                            value: *value,
                        });
                    }
                }
            }
        }
        self.send_locked_params(&st, trigger);
        self.send_changeable_avatars(&st, trigger);
        self.activity_check(&mut st, relay, trigger);
        Ok(())
    }

    // ── Cache and grant refresh ────────────────────────────────────

    /// Drop cached parameters and avatars after an edit and push fresh
    /// lists to every trigger.
    pub fn invalidate_caches(&self, relay: &Relay) -> Result<(), RelayError> {
        let mut st = self.state.lock();
        st.params.invalidate();
        st.changeable_avatars.invalidate();
        tracing::debug!(target_user = %self.target_user, "parameter cache invalidated");
        self.push_parameters(&mut st, relay)?;
        self.push_changeable_avatars(&mut st, relay)
    }

    /// Reload invite grants from storage and re-push what each trigger may
    /// now see. Returns the new grant list.
    pub fn reload_invites(&self, relay: &Relay) -> Result<Vec<Invite>, RelayError> {
        let invites = relay.store().retrieve_minimal_invites(self.user_id)?;
        let mut st = self.state.lock();
        st.invites = invites.clone();
        self.push_parameters(&mut st, relay)?;
        self.push_changeable_avatars(&mut st, relay)?;
        Ok(invites)
    }

    // ── Fan-out helpers ────────────────────────────────────────────

    fn push_all(&self, relay: &Relay, push: &TriggerPush) {
        for trigger in relay.registry().triggers_for(&self.target_user) {
            trigger.send(push);
        }
    }

    fn avatar_changed(&self, st: &mut ListenerState, relay: &Relay) -> Result<(), RelayError> {
        let previously_unsaved: Vec<String> = st
            .params()
            .iter()
            .filter(|p| !p.saved)
            .map(|p| p.name.clone())
            .collect();
        st.params.invalidate();

        self.push_all(relay, &TriggerPush::FullStatus { status: self.status(st, relay) });
        self.push_parameters(st, relay)?;

        let unsaved = st
            .params()
            .iter()
            .filter(|p| !p.saved)
            .map(|p| p.name.clone())
            .chain(previously_unsaved);
        for name in unsaved.collect::<Vec<_>>() {
            st.mutated.remove(&name);
        }
        self.push_changeable_avatars(st, relay)
    }

    fn parameters_for(&self, st: &ListenerState, trigger: &TriggerConnection) -> TriggerPush {
        let parameters = if st.parameters_hidden() {
            Vec::new()
        } else {
            trigger.validator(&st.invites).filter_viewable(st.params())
        };
        TriggerPush::Parameters { parameters }
    }

    fn push_parameters(&self, st: &mut ListenerState, relay: &Relay) -> Result<(), RelayError> {
        st.ensure_params(relay.store(), self.user_id)?;
        for trigger in relay.registry().triggers_for(&self.target_user) {
            trigger.send(&self.parameters_for(st, &trigger));
        }
        Ok(())
    }

    fn send_locked_params(&self, st: &ListenerState, trigger: &TriggerConnection) {
        if st.parameters_hidden() {
            return;
        }
        let validator = trigger.validator(&st.invites);
        for param in st.params() {
            let Some(holder) = &param.locked_by else {
                continue;
            };
            if validator.can_view(param) {
                trigger.send(&TriggerPush::ParameterLock {
                    name: param.name.clone(),
                    locked: true,
                    lock_key: (holder == trigger.client_id()).then(|| holder.clone()),
                });
            }
        }
    }

    fn send_changeable_avatars(&self, st: &ListenerState, trigger: &TriggerConnection) {
        let validator = trigger.validator(&st.invites);
        let avatars = st
            .changeable()
            .iter()
            .filter(|a| validator.can_change_avatar(st.avatar.as_ref(), a))
            .map(AvatarStatus::from)
            .collect();
        trigger.send(&TriggerPush::ChangeableAvatars { avatars });
    }

    fn push_changeable_avatars(&self, st: &mut ListenerState, relay: &Relay) -> Result<(), RelayError> {
        st.ensure_changeable(relay.store(), self.user_id)?;
        for trigger in relay.registry().triggers_for(&self.target_user) {
            self.send_changeable_avatars(st, &trigger);
        }
        Ok(())
    }

    fn status(&self, st: &ListenerState, relay: &Relay) -> ListenerStatus {
        let now = now_millis();
        ListenerStatus {
            avatar: st.avatar.as_ref().map(AvatarStatus::from),
            is_pancake: st.is_pancake,
            muted: st.muted,
            afk: st.afk,
            active: st.is_active(now, relay.config().activity_window_ms),
            vrc_open: st.vrc_open,
            avatar_change_cooldown: st.settings.as_ref().map(|_| st.cooldown_remaining(now)),
            colors: st.settings.as_ref().map(|s| Colors {
                color_primary: s.color_primary.clone(),
                dark_mode_color_primary: s.dark_mode_color_primary.clone(),
            }),
        }
    }
}
