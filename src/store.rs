//! Storage interface consumed by the relay, plus an in-memory implementation
//! that can be seeded from a TOML fixture.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::config::ConfigError;
use crate::model::{
    Avatar, Invite, Parameter, ParameterValue, TargetUser, TriggerSession,
    UserSettings,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// How to resolve an avatar: by display name or by external id.
#[derive(Debug, Clone, Copy)]
pub enum AvatarLookup<'a> {
    Name(&'a str),
    VrcUuid(&'a str),
}

impl<'a> AvatarLookup<'a> {
    /// Values carrying the external id prefix resolve by id, anything else
    /// by name.
    pub fn parse(selection: &'a str) -> Self {
        if selection.starts_with(crate::model::AVATAR_UUID_PREFIX) {
            Self::VrcUuid(selection)
        } else {
            Self::Name(selection)
        }
    }
}

/// Request/response storage calls. Implementations must be cheap to call
/// from any task; the relay never holds its own locks across these calls
/// except the owning listener's state lock.
///
/// Calls are made from async tasks while that lock is held, so they must
/// return promptly and never block on network or disk I/O. A backend with
/// real I/O should answer from an in-process cache or hand the work to
/// `tokio::task::spawn_blocking` outside the relay.
pub trait Store: Send + Sync {
    /// Check a listener's credentials, returning the user id on success.
    fn authenticate_listener(
        &self,
        user: &TargetUser,
        listen_key: &str,
    ) -> Result<Option<i64>, StoreError>;

    fn user_id(&self, user: &TargetUser) -> Result<Option<i64>, StoreError>;

    /// Parameters of one avatar in display order, with the current lock
    /// holder joined in. Value lists are left empty; LOV parameters load
    /// theirs through [`retrieve_parameter_values`](Self::retrieve_parameter_values).
    fn retrieve_parameters(
        &self,
        user_id: i64,
        avatar_vrc_uuid: Option<&str>,
    ) -> Result<Vec<Parameter>, StoreError>;

    /// Enumerated values of one LOV parameter, in display order.
    fn retrieve_parameter_values(&self, parameter_id: i64)
        -> Result<Vec<ParameterValue>, StoreError>;

    /// Acquire or release a lock. Acquiring fails if anyone holds it;
    /// releasing fails unless `client_id` holds it. Returns whether the lock
    /// row changed.
    fn set_parameter_lock(
        &self,
        user_id: i64,
        parameter_id: i64,
        locked: bool,
        client_id: &str,
        invite_id: Option<i64>,
    ) -> Result<bool, StoreError>;

    fn unlock_all(&self, user_id: i64) -> Result<(), StoreError>;

    fn retrieve_avatar(
        &self,
        user_id: i64,
        lookup: AvatarLookup<'_>,
    ) -> Result<Option<Avatar>, StoreError>;

    fn retrieve_avatars(&self, user_id: i64) -> Result<Vec<Avatar>, StoreError>;

    fn retrieve_minimal_invites(&self, user_id: i64) -> Result<Vec<Invite>, StoreError>;

    /// Resolve an invite url to the invite and the user it was issued by.
    fn find_invite(&self, url: &str) -> Result<Option<(Invite, TargetUser)>, StoreError>;

    fn delete_invite(&self, user_id: i64, url: &str) -> Result<(), StoreError>;

    fn retrieve_settings(&self, user_id: i64) -> Result<Option<UserSettings>, StoreError>;

    /// Mint a trigger session and return its token.
    fn insert_trigger_session(
        &self,
        client_id: &str,
        target_user: &TargetUser,
        invite_id: Option<i64>,
    ) -> Result<String, StoreError>;

    fn count_trigger_sessions(&self, target_user: &TargetUser) -> Result<usize, StoreError>;

    fn retrieve_trigger_session(&self, token: &str) -> Result<Option<TriggerSession>, StoreError>;

    fn delete_trigger_session(&self, token: &str) -> Result<(), StoreError>;

    fn delete_all_trigger_sessions(&self) -> Result<(), StoreError>;
}

// ── In-memory store ────────────────────────────────────────────────

struct UserRecord {
    id: i64,
    listen_key: String,
}

struct ParameterRecord {
    user_id: i64,
    avatar_id: i64,
    parameter: Parameter,
}

#[derive(Default)]
struct StoreInner {
    users: HashMap<TargetUser, UserRecord>,
    avatars: Vec<(i64, Avatar)>,
    parameters: Vec<ParameterRecord>,
    values: HashMap<i64, Vec<ParameterValue>>,
    locks: HashMap<i64, String>,
    invites: Vec<(i64, Invite)>,
    settings: HashMap<i64, UserSettings>,
    sessions: HashMap<String, TriggerSession>,
    deleted_invites: Vec<String>,
    next_id: i64,
    unavailable: bool,
}

impl StoreInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn reserve_id(&mut self, id: i64) {
        self.next_id = self.next_id.max(id);
    }

    fn user_name(&self, user_id: i64) -> Option<&TargetUser> {
        self.users
            .iter()
            .find(|(_, rec)| rec.id == user_id)
            .map(|(name, _)| name)
    }
}

/// [`Store`] backed by process memory. Used by the binary when started with
/// a fixture, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

/// Length of generated invite urls.
const INVITE_URL_LEN: usize = 8;

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<MutexGuard<'_, StoreInner>, StoreError> {
        let inner = self.inner.lock();
        if inner.unavailable {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        Ok(inner)
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    pub fn add_user(&self, name: &str, listen_key: &str) -> i64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        inner.users.insert(
            TargetUser::new(name),
            UserRecord {
                id,
                listen_key: listen_key.to_string(),
            },
        );
        id
    }

    pub fn set_settings(&self, user_id: i64, settings: UserSettings) {
        self.inner.lock().settings.insert(user_id, settings);
    }

    pub fn add_avatar(&self, user_id: i64, avatar: Avatar) {
        let mut inner = self.inner.lock();
        inner.reserve_id(avatar.id);
        inner.avatars.push((user_id, avatar));
    }

    /// Store a parameter under an avatar. An embedded value list and lock
    /// holder are split out the same way a relational store keeps them.
    pub fn add_parameter(&self, user_id: i64, avatar_id: i64, mut parameter: Parameter) {
        let mut inner = self.inner.lock();
        inner.reserve_id(parameter.id);
        if let Some(values) = parameter.values.take() {
            inner.values.insert(parameter.id, values);
        }
        if let Some(holder) = parameter.locked_by.take() {
            inner.locks.insert(parameter.id, holder);
        }
        inner.parameters.push(ParameterRecord {
            user_id,
            avatar_id,
            parameter,
        });
    }

    /// Create an invite with a random url.
    pub fn create_invite(
        &self,
        user_id: i64,
        expires: Option<i64>,
        parameter_ids: Vec<i64>,
        changeable_avatar_ids: Vec<i64>,
    ) -> Invite {
        let url: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(INVITE_URL_LEN)
            .map(char::from)
            .collect();
        let mut inner = self.inner.lock();
        let invite = Invite {
            id: inner.next_id(),
            url,
            expires,
            parameter_ids,
            changeable_avatar_ids,
        };
        inner.invites.push((user_id, invite.clone()));
        invite
    }

    fn insert_invite(&self, user_id: i64, invite: Invite) {
        let mut inner = self.inner.lock();
        inner.reserve_id(invite.id);
        inner.invites.push((user_id, invite));
    }

    /// Url of every `delete_invite` call so far, in call order, including
    /// calls that found nothing to delete.
    pub fn deleted_invites(&self) -> Vec<String> {
        self.inner.lock().deleted_invites.clone()
    }

    /// Number of trigger sessions across all users.
    pub fn trigger_session_total(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Seed a store from a TOML fixture string.
    pub fn from_fixture_str(contents: &str) -> Result<Self, toml::de::Error> {
        let fixture: Fixture = toml::from_str(contents)?;
        let store = Self::new();
        for user in fixture.users {
            let user_id = store.add_user(&user.name, &user.listen_key);
            if let Some(settings) = user.settings {
                store.set_settings(user_id, settings);
            }
            for avatar in user.avatars {
                let avatar_id = avatar.avatar.id;
                store.add_avatar(user_id, avatar.avatar);
                for parameter in avatar.parameters {
                    store.add_parameter(user_id, avatar_id, parameter);
                }
            }
            for invite in user.invites {
                store.insert_invite(user_id, invite);
            }
        }
        Ok(store)
    }

    pub fn from_fixture(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        Self::from_fixture_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }
}

impl Store for MemoryStore {
    fn authenticate_listener(
        &self,
        user: &TargetUser,
        listen_key: &str,
    ) -> Result<Option<i64>, StoreError> {
        let inner = self.guard()?;
        Ok(inner.users.get(user).and_then(|rec| {
            let ok: bool = rec.listen_key.as_bytes().ct_eq(listen_key.as_bytes()).into();
            ok.then_some(rec.id)
        }))
    }

    fn user_id(&self, user: &TargetUser) -> Result<Option<i64>, StoreError> {
        Ok(self.guard()?.users.get(user).map(|rec| rec.id))
    }

    fn retrieve_parameters(
        &self,
        user_id: i64,
        avatar_vrc_uuid: Option<&str>,
    ) -> Result<Vec<Parameter>, StoreError> {
        let inner = self.guard()?;
        let Some(vrc_uuid) = avatar_vrc_uuid else {
            return Ok(Vec::new());
        };
        let Some(avatar_id) = inner
            .avatars
            .iter()
            .find(|(uid, a)| *uid == user_id && a.vrc_uuid == vrc_uuid)
            .map(|(_, a)| a.id)
        else {
            return Ok(Vec::new());
        };
        Ok(inner
            .parameters
            .iter()
            .filter(|rec| rec.user_id == user_id && rec.avatar_id == avatar_id)
            .map(|rec| {
                let mut p = rec.parameter.clone();
                p.locked_by = inner.locks.get(&p.id).cloned();
                p
            })
            .collect())
    }

    fn retrieve_parameter_values(
        &self,
        parameter_id: i64,
    ) -> Result<Vec<ParameterValue>, StoreError> {
        Ok(self.guard()?.values.get(&parameter_id).cloned().unwrap_or_default())
    }

    fn set_parameter_lock(
        &self,
        user_id: i64,
        parameter_id: i64,
        locked: bool,
        client_id: &str,
        _invite_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.guard()?;
        let owned = inner
            .parameters
            .iter()
            .any(|rec| rec.user_id == user_id && rec.parameter.id == parameter_id);
        if !owned {
            return Ok(false);
        }
        if locked {
            if inner.locks.contains_key(&parameter_id) {
                return Ok(false);
            }
            inner.locks.insert(parameter_id, client_id.to_string());
            Ok(true)
        } else if inner.locks.get(&parameter_id).map(String::as_str) == Some(client_id) {
            inner.locks.remove(&parameter_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn unlock_all(&self, user_id: i64) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        let owned: Vec<i64> = inner
            .parameters
            .iter()
            .filter(|rec| rec.user_id == user_id)
            .map(|rec| rec.parameter.id)
            .collect();
        inner.locks.retain(|id, _| !owned.contains(id));
        Ok(())
    }

    fn retrieve_avatar(
        &self,
        user_id: i64,
        lookup: AvatarLookup<'_>,
    ) -> Result<Option<Avatar>, StoreError> {
        let inner = self.guard()?;
        Ok(inner
            .avatars
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, a)| a)
            .find(|a| match lookup {
                AvatarLookup::Name(name) => a.name == name,
                AvatarLookup::VrcUuid(uuid) => a.vrc_uuid == uuid,
            })
            .cloned())
    }

    fn retrieve_avatars(&self, user_id: i64) -> Result<Vec<Avatar>, StoreError> {
        let inner = self.guard()?;
        Ok(inner
            .avatars
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, a)| a.clone())
            .collect())
    }

    fn retrieve_minimal_invites(&self, user_id: i64) -> Result<Vec<Invite>, StoreError> {
        let inner = self.guard()?;
        Ok(inner
            .invites
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, inv)| inv.clone())
            .collect())
    }

    fn find_invite(&self, url: &str) -> Result<Option<(Invite, TargetUser)>, StoreError> {
        let inner = self.guard()?;
        let found = inner.invites.iter().find(|(_, inv)| inv.url == url);
        Ok(found.and_then(|(uid, inv)| inner.user_name(*uid).map(|u| (inv.clone(), u.clone()))))
    }

    fn delete_invite(&self, user_id: i64, url: &str) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        let before = inner.invites.len();
        inner
            .invites
            .retain(|(uid, inv)| !(*uid == user_id && inv.url == url));
        if inner.invites.len() == before {
            tracing::debug!(user_id, url, "deleting an invite that is already gone");
        }
        inner.deleted_invites.push(url.to_string());
        Ok(())
    }

    fn retrieve_settings(&self, user_id: i64) -> Result<Option<UserSettings>, StoreError> {
        Ok(self.guard()?.settings.get(&user_id).cloned())
    }

    fn insert_trigger_session(
        &self,
        client_id: &str,
        target_user: &TargetUser,
        invite_id: Option<i64>,
    ) -> Result<String, StoreError> {
        let token = uuid::Uuid::new_v4().to_string();
        self.guard()?.sessions.insert(
            token.clone(),
            TriggerSession {
                token: token.clone(),
                client_id: client_id.to_string(),
                target_user: target_user.clone(),
                invite_id,
            },
        );
        Ok(token)
    }

    fn count_trigger_sessions(&self, target_user: &TargetUser) -> Result<usize, StoreError> {
        Ok(self
            .guard()?
            .sessions
            .values()
            .filter(|s| &s.target_user == target_user)
            .count())
    }

    fn retrieve_trigger_session(&self, token: &str) -> Result<Option<TriggerSession>, StoreError> {
        Ok(self.guard()?.sessions.get(token).cloned())
    }

    fn delete_trigger_session(&self, token: &str) -> Result<(), StoreError> {
        self.guard()?.sessions.remove(token);
        Ok(())
    }

    fn delete_all_trigger_sessions(&self) -> Result<(), StoreError> {
        self.guard()?.sessions.clear();
        Ok(())
    }
}

// ── Fixture format ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct Fixture {
    #[serde(default)]
    users: Vec<FixtureUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixtureUser {
    name: String,
    listen_key: String,
    #[serde(default)]
    settings: Option<UserSettings>,
    #[serde(default)]
    avatars: Vec<FixtureAvatar>,
    #[serde(default)]
    invites: Vec<Invite>,
}

#[derive(Deserialize)]
struct FixtureAvatar {
    #[serde(flatten)]
    avatar: Avatar,
    #[serde(default)]
    parameters: Vec<Parameter>,
}
