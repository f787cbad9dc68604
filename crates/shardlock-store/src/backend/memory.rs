//! In-process document backend.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::trace;

use super::{Precondition, SessionBackend, SessionUpdate, WriteConcern};
use crate::error::Result;
use crate::record::{SessionEndCandidate, SessionKey, SessionRecord};

/// Writes observed by a [`MemoryBackend`], split by acknowledgement level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub acknowledged: u64,
    pub relaxed: u64,
    /// Lock-changing writes issued with [`WriteConcern::Relaxed`].
    pub relaxed_lock_writes: u64,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<SessionKey, SessionRecord>,
    writes: WriteCounts,
}

impl Inner {
    fn count_write(&mut self, concern: WriteConcern, touches_lock: bool) {
        match concern {
            WriteConcern::Acknowledged => self.writes.acknowledged += 1,
            WriteConcern::Relaxed => {
                self.writes.relaxed += 1;
                if touches_lock {
                    self.writes.relaxed_lock_writes += 1;
                }
            }
        }
    }
}

/// Backend holding every record in a single mutex-guarded map.
///
/// Each primitive runs entirely under the mutex, which gives the same
/// atomicity a document database's find-and-modify does.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write counters since creation.
    pub fn write_counts(&self) -> WriteCounts {
        self.inner.lock().writes
    }
}

impl SessionBackend for MemoryBackend {
    fn find(&self, key: &SessionKey) -> Result<Option<SessionRecord>> {
        Ok(self.inner.lock().records.get(key).cloned())
    }

    fn find_and_modify(
        &self,
        key: &SessionKey,
        precondition: &Precondition,
        update: &SessionUpdate,
        concern: WriteConcern,
    ) -> Result<Option<SessionRecord>> {
        let mut inner = self.inner.lock();
        inner.count_write(concern, update.touches_lock());

        let Some(record) = inner.records.get_mut(key) else {
            trace!(key = %key, "find_and_modify: no record");
            return Ok(None);
        };
        if !precondition.matches(record) {
            trace!(key = %key, ?precondition, "find_and_modify: precondition failed");
            return Ok(None);
        }
        update.apply(record);
        Ok(Some(record.clone()))
    }

    fn delete_if(
        &self,
        key: &SessionKey,
        precondition: &Precondition,
        concern: WriteConcern,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.count_write(concern, true);

        let matched = inner
            .records
            .get(key)
            .is_some_and(|record| precondition.matches(record));
        if matched {
            inner.records.remove(key);
        }
        Ok(matched)
    }

    fn upsert(&self, record: &SessionRecord, concern: WriteConcern) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.count_write(concern, true);
        inner.records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn expiring_before(
        &self,
        application: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionEndCandidate>> {
        let inner = self.inner.lock();
        let mut candidates: Vec<SessionEndCandidate> = inner
            .records
            .values()
            .filter(|r| r.key.application == application && r.expires_at < before)
            .map(|r| SessionEndCandidate {
                session_id: r.key.session_id.clone(),
                expires_at: r.expires_at,
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.expires_at
                .cmp(&b.expires_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn count(&self, application: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .records
            .keys()
            .filter(|k| k.application == application)
            .count())
    }
}
