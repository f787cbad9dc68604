//! Session records as held by the backing store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cookie::LockCookie;

/// Identity of a stored session: `(application, session_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub application: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(application: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.session_id)
    }
}

/// Bitset of pending session lifecycle actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionFlags(u32);

impl ActionFlags {
    /// No pending action.
    pub const NONE: Self = Self(0);
    /// Created by the host before any state was written.
    pub const UNINITIALIZED: Self = Self(1);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ActionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Decoded session state handed to and from callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionItem {
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// Sliding timeout declared by this session.
    pub timeout_minutes: u32,
}

impl SessionItem {
    pub fn new(payload: Vec<u8>, timeout_minutes: u32) -> Self {
        Self {
            payload,
            timeout_minutes,
        }
    }

    /// An empty item, as created for a brand-new session.
    pub fn empty(timeout_minutes: u32) -> Self {
        Self::new(Vec::new(), timeout_minutes)
    }
}

/// A session document exactly as the backing store holds it.
///
/// `payload` is the encoded form; see [`crate::codec::PayloadCodec`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub timeout_minutes: u32,
    pub flags: ActionFlags,
    pub payload: Vec<u8>,
    pub lock: Option<LockCookie>,
}

impl SessionRecord {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

/// A session picked by an expiration scan, pending the lock-and-confirm step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndCandidate {
    pub session_id: String,
    /// Expiry as read by the scan; the claim fails if it has moved since.
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = ActionFlags::NONE | ActionFlags::UNINITIALIZED;
        assert!(flags.contains(ActionFlags::UNINITIALIZED));
        assert!(!flags.is_empty());
        assert!(ActionFlags::NONE.is_empty());
        assert_eq!(ActionFlags::from_bits(1), ActionFlags::UNINITIALIZED);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(SessionKey::new("app", "abc").to_string(), "app/abc");
    }
}
