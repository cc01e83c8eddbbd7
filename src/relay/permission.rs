//! View/modify decisions for one requester against one listener's state.
//!
//! Everything here is pure: the caller supplies the listener's current
//! invite grants and the parameter definitions, and gets a yes/no back.
//! Denials are never errors; the relay drops denied requests silently.

use crate::model::{find_invite, Avatar, Invite, ParamValue, Parameter, ParameterView};

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester<'a> {
    /// The listener's own account.
    Owner,
    /// A dashboard session, optionally scoped by an invite.
    Trigger {
        client_id: &'a str,
        invite_id: Option<i64>,
    },
}

impl<'a> Requester<'a> {
    fn client_id(&self) -> Option<&'a str> {
        match self {
            Self::Owner => None,
            Self::Trigger { client_id, .. } => Some(client_id),
        }
    }
}

pub struct PermissionValidator<'a> {
    requester: Requester<'a>,
    invites: &'a [Invite],
}

impl<'a> PermissionValidator<'a> {
    /// `invites` is the listener's current grant list. An invite id the
    /// requester carries but that is no longer in this list grants nothing.
    pub fn new(requester: Requester<'a>, invites: &'a [Invite]) -> Self {
        Self { requester, invites }
    }

    fn invite(&self) -> Option<&'a Invite> {
        match self.requester {
            Requester::Owner => None,
            Requester::Trigger { invite_id, .. } => find_invite(self.invites, invite_id),
        }
    }

    fn holds_valid_invite(&self) -> bool {
        matches!(self.requester, Requester::Owner) || self.invite().is_some()
    }

    pub fn can_view(&self, param: &Parameter) -> bool {
        match self.requester {
            Requester::Owner => true,
            Requester::Trigger { .. } => {
                !param.requires_invite || self.invite().is_some_and(|inv| inv.grants_parameter(param.id))
            }
        }
    }

    /// Parameter-level view check plus value-level gating for parameters
    /// with an enumerated value list.
    pub fn can_view_value(&self, param: &Parameter, value: &ParamValue) -> bool {
        if !self.can_view(param) {
            return false;
        }
        match &param.values {
            None => true,
            Some(values) => values
                .iter()
                .find(|entry| value.matches(&entry.value))
                .is_some_and(|entry| !entry.requires_invite || self.holds_valid_invite()),
        }
    }

    pub fn can_modify(&self, param: &Parameter) -> bool {
        self.can_view(param) && param.lock_permits(self.requester.client_id())
    }

    pub fn can_modify_value(&self, param: &Parameter, value: &ParamValue) -> bool {
        self.can_view_value(param, value) && param.lock_permits(self.requester.client_id())
    }

    /// Releasing a lock nobody holds is not a valid request.
    pub fn can_lock(&self, param: &Parameter, locked: bool) -> bool {
        if !locked && param.locked_by.is_none() {
            return false;
        }
        self.can_modify(param) && param.lockable
    }

    /// Copies of every parameter this requester may view, value lists cut
    /// down to viewable entries and foreign lock holders redacted.
    pub fn filter_viewable(&self, params: &[Parameter]) -> Vec<ParameterView> {
        let me = self.requester.client_id();
        params
            .iter()
            .filter(|p| self.can_view(p))
            .map(|p| {
                let mut copy = p.clone();
                if let Some(values) = copy.values.as_mut() {
                    values.retain(|entry| !entry.requires_invite || self.holds_valid_invite());
                }
                let holder = copy.locked_by.take();
                let lock_key = holder.clone().filter(|h| Some(h.as_str()) == me);
                ParameterView {
                    parameter: copy,
                    locked: holder.is_some(),
                    lock_key,
                }
            })
            .collect()
    }

    /// Whether the requester may move the listener from `current` to
    /// `target`. Invite-scoped triggers need both avatars in their invite.
    pub fn can_change_avatar(&self, current: Option<&Avatar>, target: &Avatar) -> bool {
        let Some(current) = current else {
            return false;
        };
        match self.requester {
            Requester::Owner | Requester::Trigger { invite_id: None, .. } => true,
            Requester::Trigger { .. } => self
                .invite()
                .is_some_and(|inv| inv.grants_avatar(current.id) && inv.grants_avatar(target.id)),
        }
    }
}
