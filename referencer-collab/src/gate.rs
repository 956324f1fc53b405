//! Role-based write authorization.
//!
//! | Message        | Access   | Editor | Viewer        |
//! |----------------|----------|--------|---------------|
//! | SyncStep1      | Read     | allow  | allow         |
//! | SyncStep2      | Mutate   | allow  | silent drop   |
//! | Update         | Mutate   | allow  | silent drop   |
//! | Awareness      | Presence | allow  | allow         |
//! | QueryAwareness | Read     | allow  | allow         |
//!
//! Denied messages produce no reply and no broadcast, so a viewer cannot
//! distinguish a denial from a no-op.

use std::fmt;
use std::str::FromStr;

use crate::protocol::{Message, SyncStep};

/// Connection role, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    Editor,
    /// Least privileged; the fallback for missing or unknown role strings.
    #[default]
    Viewer,
}

impl Role {
    /// Parse a role selector such as the `role` query parameter.
    ///
    /// Unknown or missing values map to [`Role::Viewer`].
    pub fn from_param(param: Option<&str>) -> Self {
        param
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or_default()
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::Editor)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("editor") {
            Ok(Self::Editor)
        } else if s.eq_ignore_ascii_case("viewer") {
            Ok(Self::Viewer)
        } else {
            Err(UnknownRole(s.to_string()))
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

/// What a message does to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Reads state; answered to the sender only.
    Read,
    /// Changes the shared document.
    Mutate,
    /// Ephemeral, non-authoritative presence.
    Presence,
}

impl Access {
    pub fn of(message: &Message) -> Self {
        match message {
            Message::Sync(SyncStep::Step1, _) | Message::QueryAwareness => Self::Read,
            Message::Sync(..) => Self::Mutate,
            Message::Awareness(_) => Self::Presence,
        }
    }
}

/// A mutating message from a session without write permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{role} session may not apply {step:?}")]
pub struct AuthorizationDenied {
    pub role: Role,
    pub step: SyncStep,
}

/// Decide whether `role` may have `message` processed.
pub fn authorize(role: Role, message: &Message) -> Result<Access, AuthorizationDenied> {
    let access = Access::of(message);
    match (access, message) {
        (Access::Mutate, Message::Sync(step, _)) if !role.can_write() => {
            Err(AuthorizationDenied { role, step: *step })
        }
        _ => Ok(access),
    }
}
