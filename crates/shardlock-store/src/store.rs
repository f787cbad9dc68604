//! Per-shard session store: CRUD, cooperative locking and expiration
//! candidate queries translated into backend primitives.
//!
//! Mutual exclusion for a session is enforced only by the backend's
//! conditional writes: acquiring requires "unlocked", and every later write
//! requires "locked by my token". A write presenting the wrong token is a
//! silent no-op.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use crate::backend::{Precondition, SessionBackend, SessionUpdate, WriteConcern};
use crate::clock::{Clock, SystemClock, truncate_to_millis};
use crate::codec::{FramedCodec, PayloadCodec};
use crate::config::StoreConfig;
use crate::cookie::LockCookie;
use crate::error::Result;
use crate::record::{
    ActionFlags, SessionEndCandidate, SessionItem, SessionKey, SessionRecord,
};

/// Expiration candidates fetched per scan.
pub const PREFETCH_BATCH: usize = 16;

/// How far a claimed expired session's expiry is pushed out, so other
/// sweepers do not select it again while it is being processed.
pub const EXPIRED_LOCK_GRACE: Duration = Duration::minutes(2);

/// Decoded state of an unlocked (or just-locked) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemState {
    pub item: SessionItem,
    pub flags: ActionFlags,
}

/// Result of a shared (non-locking) read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No such session.
    Missing,
    /// Session exists but is held by someone; its state is not returned.
    Locked(LockCookie),
    /// Session exists and is unlocked.
    Available(ItemState),
}

/// Lock state of a stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Missing,
    Unlocked,
    Locked(LockCookie),
}

/// An expired session claimed by a sweeper, locked with `cookie`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSession {
    pub session_id: String,
    pub state: ItemState,
    pub cookie: LockCookie,
}

/// What the expiration sweeper needs from a store.
pub trait ExpirableStore: Send + Sync {
    /// Find any session of `application` expired before `signal_time` and
    /// lock it. `None` when nothing expired could be claimed.
    fn get_expired_item_exclusive(
        &self,
        application: &str,
        signal_time: DateTime<Utc>,
    ) -> Result<Option<ExpiredSession>>;

    /// Delete a session held with `cookie`. No-op on token mismatch.
    fn remove_item(&self, application: &str, session_id: &str, cookie: &LockCookie)
    -> Result<()>;
}

/// Full request-path surface, implemented by [`SessionStore`] and
/// [`PartitionedStore`](crate::PartitionedStore).
pub trait SessionStateStore: ExpirableStore {
    /// Shared read. Refreshes the sliding expiry as a side effect.
    fn get_item(&self, application: &str, session_id: &str) -> Result<ReadOutcome>;

    /// Lock the session with `cookie` if it is currently unlocked.
    ///
    /// `None` means locked by someone else or missing; use
    /// [`get_item_lock`](Self::get_item_lock) to tell them apart.
    fn get_item_exclusive(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
    ) -> Result<Option<ItemState>>;

    /// Read the lock state without modifying anything.
    fn get_item_lock(&self, application: &str, session_id: &str) -> Result<LockStatus>;

    /// Replace state and release the lock, if `cookie` still holds it.
    fn update_and_release_item(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
        flags: ActionFlags,
        item: &SessionItem,
    ) -> Result<()>;

    /// Release the lock, if `cookie` still holds it.
    fn release_item(&self, application: &str, session_id: &str, cookie: &LockCookie)
    -> Result<()>;

    /// Create or replace a session unconditionally, unlocked.
    fn insert_item(
        &self,
        application: &str,
        session_id: &str,
        flags: ActionFlags,
        item: &SessionItem,
    ) -> Result<()>;

    /// Push expiry to now + timeout, reading the stored timeout when
    /// `timeout_minutes` is `None`. Best effort.
    fn update_item_expiration(
        &self,
        application: &str,
        session_id: &str,
        timeout_minutes: Option<u32>,
    ) -> Result<()>;

    /// Number of shards behind this store.
    fn shard_count(&self) -> usize;

    /// Shard by index, for diagnostics.
    fn shard(&self, index: usize) -> Option<&SessionStore>;

    /// The store's notion of "now".
    fn now(&self) -> DateTime<Utc>;
}

/// Session store over a single backend (one shard).
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    codec: Arc<dyn PayloadCodec>,
    clock: Arc<dyn Clock>,
    default_timeout_minutes: u32,
    compress_payload: bool,
    partition: usize,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("partition", &self.partition)
            .field("default_timeout_minutes", &self.default_timeout_minutes)
            .field("compress_payload", &self.compress_payload)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Create a store over `backend` using the timeout and compression
    /// settings from `config`.
    pub fn new(backend: Arc<dyn SessionBackend>, config: &StoreConfig) -> Self {
        Self {
            backend,
            codec: Arc::new(FramedCodec),
            clock: Arc::new(SystemClock),
            default_timeout_minutes: config.default_timeout_minutes,
            compress_payload: config.compress_payload,
            partition: 0,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Tag this store with its partition index (used in log fields).
    pub fn with_partition(mut self, partition: usize) -> Self {
        self.partition = partition;
        self
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    /// Number of sessions stored for `application` in this shard.
    pub fn count(&self, application: &str) -> Result<usize> {
        self.backend.count(application)
    }

    /// Sessions expired before `signal_time`, oldest first. Pure read.
    pub fn get_session_end_candidates(
        &self,
        application: &str,
        signal_time: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionEndCandidate>> {
        self.backend.expiring_before(application, signal_time, limit)
    }

    /// Lock an expiration candidate, provided its expiry has not moved
    /// since the scan. The claimed session's expiry is pushed out by
    /// [`EXPIRED_LOCK_GRACE`].
    pub fn get_expired_candidate_exclusive(
        &self,
        application: &str,
        candidate: &SessionEndCandidate,
        cookie: &LockCookie,
    ) -> Result<Option<ItemState>> {
        let key = SessionKey::new(application, candidate.session_id.as_str());
        let update = SessionUpdate::new()
            .set_lock(cookie.clone())
            .expires_at(self.now_millis() + EXPIRED_LOCK_GRACE);

        let claimed = self.backend.find_and_modify(
            &key,
            &Precondition::expires_at(candidate.expires_at),
            &update,
            WriteConcern::Acknowledged,
        )?;
        match claimed {
            Some(record) => Ok(Some(self.decode(&record)?)),
            None => {
                debug!(
                    session_id = %candidate.session_id,
                    partition = self.partition,
                    "Expiration candidate changed since scan"
                );
                Ok(None)
            }
        }
    }

    fn now_millis(&self) -> DateTime<Utc> {
        truncate_to_millis(self.clock.now())
    }

    fn expiry_after(&self, minutes: u32) -> DateTime<Utc> {
        self.now_millis() + Duration::minutes(i64::from(minutes))
    }

    fn decode(&self, record: &SessionRecord) -> Result<ItemState> {
        Ok(ItemState {
            item: SessionItem::new(
                self.codec.decode(&record.payload)?,
                record.timeout_minutes,
            ),
            flags: record.flags,
        })
    }

    /// Re-apply the session's own timeout when it differs from the default
    /// used for the initial refresh.
    fn apply_declared_timeout(&self, record: &SessionRecord) -> Result<()> {
        if record.timeout_minutes != self.default_timeout_minutes {
            self.update_item_expiration(
                &record.key.application,
                &record.key.session_id,
                Some(record.timeout_minutes),
            )?;
        }
        Ok(())
    }
}

/// Try candidates one at a time until one is claimed. `pick` chooses the
/// index of the next candidate to try among those remaining.
pub(crate) fn claim_from_batch(
    store: &SessionStore,
    application: &str,
    mut candidates: Vec<SessionEndCandidate>,
    mut pick: impl FnMut(usize) -> usize,
) -> Result<Option<ExpiredSession>> {
    while !candidates.is_empty() {
        let index = pick(candidates.len()).min(candidates.len() - 1);
        let candidate = candidates.remove(index);
        let cookie = LockCookie::new(store.now_millis());
        if let Some(state) = store.get_expired_candidate_exclusive(application, &candidate, &cookie)? {
            trace!(
                session_id = %candidate.session_id,
                partition = store.partition,
                "Claimed expired session"
            );
            return Ok(Some(ExpiredSession {
                session_id: candidate.session_id,
                state,
                cookie,
            }));
        }
    }
    Ok(None)
}

impl ExpirableStore for SessionStore {
    /// Unpartitioned scan: candidates are tried oldest first.
    fn get_expired_item_exclusive(
        &self,
        application: &str,
        signal_time: DateTime<Utc>,
    ) -> Result<Option<ExpiredSession>> {
        let candidates = self.get_session_end_candidates(application, signal_time, PREFETCH_BATCH)?;
        claim_from_batch(self, application, candidates, |_| 0)
    }

    fn remove_item(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
    ) -> Result<()> {
        let key = SessionKey::new(application, session_id);
        let removed =
            self.backend
                .delete_if(&key, &Precondition::held_by(cookie), WriteConcern::Acknowledged)?;
        if !removed {
            debug!(session_id = %session_id, "Remove skipped: lock not held by caller");
        }
        Ok(())
    }
}

impl SessionStateStore for SessionStore {
    fn get_item(&self, application: &str, session_id: &str) -> Result<ReadOutcome> {
        let key = SessionKey::new(application, session_id);
        let update = SessionUpdate::new().expires_at(self.expiry_after(self.default_timeout_minutes));

        let Some(record) = self.backend.find_and_modify(
            &key,
            &Precondition::exists(),
            &update,
            WriteConcern::Relaxed,
        )?
        else {
            return Ok(ReadOutcome::Missing);
        };
        self.apply_declared_timeout(&record)?;

        match record.lock {
            Some(cookie) => Ok(ReadOutcome::Locked(cookie)),
            None => Ok(ReadOutcome::Available(self.decode(&record)?)),
        }
    }

    fn get_item_exclusive(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
    ) -> Result<Option<ItemState>> {
        let key = SessionKey::new(application, session_id);
        let update = SessionUpdate::new()
            .set_lock(cookie.clone())
            .expires_at(self.expiry_after(self.default_timeout_minutes));

        let Some(record) = self.backend.find_and_modify(
            &key,
            &Precondition::unlocked(),
            &update,
            WriteConcern::Acknowledged,
        )?
        else {
            debug!(session_id = %session_id, partition = self.partition, "Exclusive read missed");
            return Ok(None);
        };
        self.apply_declared_timeout(&record)?;
        Ok(Some(self.decode(&record)?))
    }

    fn get_item_lock(&self, application: &str, session_id: &str) -> Result<LockStatus> {
        let key = SessionKey::new(application, session_id);
        Ok(match self.backend.find(&key)? {
            None => LockStatus::Missing,
            Some(SessionRecord { lock: None, .. }) => LockStatus::Unlocked,
            Some(SessionRecord {
                lock: Some(cookie), ..
            }) => LockStatus::Locked(cookie),
        })
    }

    fn update_and_release_item(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
        flags: ActionFlags,
        item: &SessionItem,
    ) -> Result<()> {
        let key = SessionKey::new(application, session_id);
        let update = SessionUpdate::new()
            .clear_lock()
            .flags(flags)
            .payload(self.codec.encode(&item.payload, self.compress_payload)?)
            .timeout_minutes(item.timeout_minutes)
            .expires_at(self.expiry_after(item.timeout_minutes));

        let updated = self.backend.find_and_modify(
            &key,
            &Precondition::held_by(cookie),
            &update,
            WriteConcern::Acknowledged,
        )?;
        if updated.is_none() {
            debug!(session_id = %session_id, "Update skipped: lock not held by caller");
        }
        Ok(())
    }

    fn release_item(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
    ) -> Result<()> {
        let key = SessionKey::new(application, session_id);
        let released = self.backend.find_and_modify(
            &key,
            &Precondition::held_by(cookie),
            &SessionUpdate::new().clear_lock(),
            WriteConcern::Acknowledged,
        )?;
        if released.is_none() {
            debug!(session_id = %session_id, "Release skipped: lock not held by caller");
        }
        Ok(())
    }

    fn insert_item(
        &self,
        application: &str,
        session_id: &str,
        flags: ActionFlags,
        item: &SessionItem,
    ) -> Result<()> {
        let now = self.now_millis();
        let record = SessionRecord {
            key: SessionKey::new(application, session_id),
            created_at: now,
            expires_at: now + Duration::minutes(i64::from(item.timeout_minutes)),
            timeout_minutes: item.timeout_minutes,
            flags,
            payload: self.codec.encode(&item.payload, self.compress_payload)?,
            lock: None,
        };
        self.backend.upsert(&record, WriteConcern::Acknowledged)
    }

    fn update_item_expiration(
        &self,
        application: &str,
        session_id: &str,
        timeout_minutes: Option<u32>,
    ) -> Result<()> {
        let key = SessionKey::new(application, session_id);
        let timeout = match timeout_minutes {
            Some(minutes) => minutes,
            None => match self.backend.find(&key)? {
                Some(record) => record.timeout_minutes,
                None => return Ok(()),
            },
        };

        self.backend.find_and_modify(
            &key,
            &Precondition::exists(),
            &SessionUpdate::new().expires_at(self.expiry_after(timeout)),
            WriteConcern::Relaxed,
        )?;
        Ok(())
    }

    fn shard_count(&self) -> usize {
        1
    }

    fn shard(&self, index: usize) -> Option<&SessionStore> {
        (index == 0).then_some(self)
    }

    fn now(&self) -> DateTime<Utc> {
        self.now_millis()
    }
}
