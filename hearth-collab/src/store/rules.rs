//! Server-side access rules.
//!
//! Rules are evaluated by the store for every read and write against the
//! identity the store handle (or gateway connection) is bound to. A
//! rejected request surfaces as [`StoreError::PermissionDenied`].
//!
//! [`StoreError::PermissionDenied`]: super::StoreError::PermissionDenied

use super::path::{ROOMS, USERS};
use super::{Fields, Operation};
use crate::model::SYSTEM_USER_ID;
use serde_json::Value;

/// A single request as seen by the rules.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    /// Authenticated uid, None when signed out
    pub auth: Option<&'a str>,
    /// Document path, or collection path for `list`
    pub path: &'a str,
    pub operation: Operation,
    /// Current document (get/update/delete)
    pub existing: Option<&'a Fields>,
    /// Resulting document after the write (create/update)
    pub incoming: Option<&'a Fields>,
}

/// Read access to other documents while evaluating a request.
pub type Lookup<'a> = dyn Fn(&str) -> Option<Fields> + 'a;

/// Access-control policy evaluated by the store.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, req: &AccessRequest<'_>, lookup: &Lookup<'_>) -> bool;
}

/// Allows every request. Useful for tests and trusted tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _req: &AccessRequest<'_>, _lookup: &Lookup<'_>) -> bool {
        true
    }
}

/// Policy built from a closure, see [`policy_fn`].
pub struct FnPolicy<F>(F);

/// Wrap a closure as an [`AccessPolicy`].
pub fn policy_fn<F>(f: F) -> FnPolicy<F>
where
    F: Fn(&AccessRequest<'_>) -> bool + Send + Sync,
{
    FnPolicy(f)
}

impl<F> AccessPolicy for FnPolicy<F>
where
    F: Fn(&AccessRequest<'_>) -> bool + Send + Sync,
{
    fn allows(&self, req: &AccessRequest<'_>, _lookup: &Lookup<'_>) -> bool {
        (self.0)(req)
    }
}

/// Rules for the reading-room data layout.
///
/// ```text
/// users/{uid}                     read: signed in    write: uid only
/// rooms                           list: signed in
/// rooms/{id}                      get: signed in
///                                 create: creatorId == uid, uid in members
///                                 update: members only grow, rest unchanged
///                                 delete: creator
/// rooms/{id}/{coll}[/{doc}]       room members only
///                                 create: userId == uid or "system"
///                                 update/delete: own records
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadingRoomRules;

impl AccessPolicy for ReadingRoomRules {
    fn allows(&self, req: &AccessRequest<'_>, lookup: &Lookup<'_>) -> bool {
        let Some(uid) = req.auth else {
            return false;
        };
        let segments: Vec<&str> = req.path.split('/').collect();

        match segments.as_slice() {
            [USERS] => req.operation == Operation::List,
            [USERS, user_id] => match req.operation {
                Operation::Get => true,
                Operation::Create | Operation::Update | Operation::Delete => *user_id == uid,
                Operation::List => false,
            },
            [ROOMS] => req.operation == Operation::List,
            [ROOMS, _] => room_rule(uid, req),
            [ROOMS, room_id, _] => {
                req.operation == Operation::List && is_member(uid, room_id, lookup)
            }
            [ROOMS, room_id, _, _] => {
                if !is_member(uid, room_id, lookup) {
                    return false;
                }
                match req.operation {
                    Operation::Get => true,
                    Operation::Create => req
                        .incoming
                        .and_then(|d| str_field(d, "userId"))
                        .is_some_and(|author| author == uid || author == SYSTEM_USER_ID),
                    Operation::Update | Operation::Delete => match req.existing {
                        Some(existing) => str_field(existing, "userId") == Some(uid),
                        // Deleting something already gone
                        None => req.operation == Operation::Delete,
                    },
                    Operation::List => false,
                }
            }
            _ => false,
        }
    }
}

fn room_rule(uid: &str, req: &AccessRequest<'_>) -> bool {
    match req.operation {
        Operation::Get => true,
        Operation::List => false,
        Operation::Create => req.incoming.is_some_and(|room| {
            str_field(room, "creatorId") == Some(uid) && string_array(room, "members").contains(&uid)
        }),
        Operation::Update => match (req.existing, req.incoming) {
            (Some(before), Some(after)) => {
                let members_before = string_array(before, "members");
                let members_after = string_array(after, "members");
                let kept = members_before.iter().all(|m| members_after.contains(m));
                // Users may only add themselves
                let joined_self = members_after
                    .iter()
                    .all(|m| members_before.contains(m) || *m == uid);
                let frozen = ["name", "pdfName", "creatorId", "createdAt"]
                    .iter()
                    .all(|field| before.get(*field) == after.get(*field));
                kept && joined_self && frozen
            }
            _ => false,
        },
        Operation::Delete => match req.existing {
            Some(room) => str_field(room, "creatorId") == Some(uid),
            None => true,
        },
    }
}

fn is_member(uid: &str, room_id: &str, lookup: &Lookup<'_>) -> bool {
    lookup(&format!("{ROOMS}/{room_id}"))
        .is_some_and(|room| string_array(&room, "members").contains(&uid))
}

fn str_field<'a>(fields: &'a Fields, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(Value::as_str)
}

fn string_array<'a>(fields: &'a Fields, name: &str) -> Vec<&'a str> {
    fields
        .get(name)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}
