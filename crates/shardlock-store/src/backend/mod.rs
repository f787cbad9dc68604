//! Backing-store abstraction.
//!
//! A backend offers the handful of atomic primitives the session store is
//! built on: conditional update, conditional delete, upsert and a sorted,
//! capped range read over expiry. Every primitive is independently atomic;
//! there are no multi-record transactions.
//!
//! ```text
//! SessionBackend (trait)
//!     └── MemoryBackend   - document-style, in-process (tests, single node)
//!     └── SqliteBackend   - relational, rusqlite; shareable between processes
//! ```

mod memory;
mod sqlite;

use chrono::{DateTime, Utc};

use crate::cookie::LockCookie;
use crate::error::Result;
use crate::record::{ActionFlags, SessionEndCandidate, SessionKey, SessionRecord};

pub use memory::{MemoryBackend, WriteCounts};
pub use sqlite::SqliteBackend;

/// Acknowledgement level requested for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteConcern {
    /// Wait for the write to be durable. Required for anything touching a lock.
    Acknowledged,
    /// Best effort; used for sliding-expiry refreshes.
    Relaxed,
}

/// Constraint on the lock field of a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockMatch {
    /// Any lock state.
    Any,
    /// The record must not be locked.
    Unlocked,
    /// The record must be locked with exactly this token.
    HeldBy(String),
}

/// Predicate a stored record must satisfy for a conditional write to apply.
///
/// The record must always exist; the remaining fields narrow further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub lock: LockMatch,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Precondition {
    /// Record exists.
    pub fn exists() -> Self {
        Self {
            lock: LockMatch::Any,
            expires_at: None,
        }
    }

    /// Record exists and is unlocked.
    pub fn unlocked() -> Self {
        Self {
            lock: LockMatch::Unlocked,
            expires_at: None,
        }
    }

    /// Record exists and is locked by `cookie`.
    pub fn held_by(cookie: &LockCookie) -> Self {
        Self {
            lock: LockMatch::HeldBy(cookie.token().to_string()),
            expires_at: None,
        }
    }

    /// Record exists and its expiry still equals `expires_at`.
    pub fn expires_at(expires_at: DateTime<Utc>) -> Self {
        Self {
            lock: LockMatch::Any,
            expires_at: Some(expires_at),
        }
    }

    /// Evaluate against a record in memory.
    pub fn matches(&self, record: &SessionRecord) -> bool {
        let lock_ok = match &self.lock {
            LockMatch::Any => true,
            LockMatch::Unlocked => record.lock.is_none(),
            LockMatch::HeldBy(token) => record
                .lock
                .as_ref()
                .is_some_and(|held| held.token() == token),
        };
        lock_ok && self.expires_at.is_none_or(|at| record.expires_at == at)
    }
}

/// Field changes applied by a conditional update. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    /// `Some(None)` clears the lock, `Some(Some(c))` sets it.
    pub lock: Option<Option<LockCookie>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub timeout_minutes: Option<u32>,
    pub flags: Option<ActionFlags>,
    pub payload: Option<Vec<u8>>,
}

impl SessionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_lock(mut self, cookie: LockCookie) -> Self {
        self.lock = Some(Some(cookie));
        self
    }

    pub fn clear_lock(mut self) -> Self {
        self.lock = Some(None);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn flags(mut self, flags: ActionFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// True when the update changes lock ownership.
    pub fn touches_lock(&self) -> bool {
        self.lock.is_some()
    }

    /// Apply to a record in memory.
    pub fn apply(&self, record: &mut SessionRecord) {
        if let Some(lock) = &self.lock {
            record.lock = lock.clone();
        }
        if let Some(at) = self.expires_at {
            record.expires_at = at;
        }
        if let Some(minutes) = self.timeout_minutes {
            record.timeout_minutes = minutes;
        }
        if let Some(flags) = self.flags {
            record.flags = flags;
        }
        if let Some(payload) = &self.payload {
            record.payload = payload.clone();
        }
    }
}

/// Storage primitives required by [`SessionStore`](crate::SessionStore).
pub trait SessionBackend: Send + Sync {
    /// Read a record without modifying it.
    fn find(&self, key: &SessionKey) -> Result<Option<SessionRecord>>;

    /// Atomically check `precondition` and apply `update`.
    ///
    /// Returns the post-update record, or `None` when the record is absent or
    /// the precondition failed. Never applies partially.
    fn find_and_modify(
        &self,
        key: &SessionKey,
        precondition: &Precondition,
        update: &SessionUpdate,
        concern: WriteConcern,
    ) -> Result<Option<SessionRecord>>;

    /// Atomically delete the record if `precondition` holds.
    fn delete_if(
        &self,
        key: &SessionKey,
        precondition: &Precondition,
        concern: WriteConcern,
    ) -> Result<bool>;

    /// Replace or insert the record unconditionally.
    fn upsert(&self, record: &SessionRecord, concern: WriteConcern) -> Result<()>;

    /// Records of `application` expiring strictly before `before`, oldest
    /// first, at most `limit` of them.
    fn expiring_before(
        &self,
        application: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionEndCandidate>>;

    /// Number of stored records for `application`.
    fn count(&self, application: &str) -> Result<usize>;
}
