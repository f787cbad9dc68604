//! Fan-out over several [`SessionStore`] shards.
//!
//! Keyed operations are routed by [`PartitionRouter`] and delegated
//! unchanged. The un-keyed expiration claim walks the shards starting from a
//! random one and picks randomly inside each prefetched batch, so concurrent
//! sweepers spread out instead of all contending for the oldest record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, trace};

use crate::backend::SessionBackend;
use crate::clock::Clock;
use crate::codec::PayloadCodec;
use crate::config::StoreConfig;
use crate::cookie::LockCookie;
use crate::error::{Result, StoreError};
use crate::record::{ActionFlags, SessionItem};
use crate::router::PartitionRouter;
use crate::store::{
    ExpirableStore, ExpiredSession, ItemState, LockStatus, PREFETCH_BATCH, ReadOutcome,
    SessionStateStore, SessionStore, claim_from_batch,
};

/// Session store spread over a fixed set of shards.
pub struct PartitionedStore {
    partitions: Vec<SessionStore>,
    router: PartitionRouter,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl std::fmt::Debug for PartitionedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedStore")
            .field("partitions", &self.partitions.len())
            .finish_non_exhaustive()
    }
}

impl PartitionedStore {
    /// Build from ready shards. Shard `i` must always be handed in at
    /// position `i`, or sessions will be looked up in the wrong place.
    pub fn new(partitions: Vec<SessionStore>) -> Result<Self> {
        if partitions.is_empty() {
            return Err(StoreError::Configuration(
                "a partitioned store needs at least one partition".to_string(),
            ));
        }
        let partitions = partitions
            .into_iter()
            .enumerate()
            .map(|(index, store)| store.with_partition(index))
            .collect::<Vec<_>>();
        Ok(Self {
            router: PartitionRouter::new(partitions.len()),
            partitions,
            rng: Mutex::new(Box::new(StdRng::from_os_rng())),
        })
    }

    /// Build one shard per backend using `config`'s timeout and compression
    /// settings.
    pub fn from_backends(
        backends: Vec<Arc<dyn SessionBackend>>,
        config: &StoreConfig,
        codec: Arc<dyn PayloadCodec>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let shards = backends
            .into_iter()
            .map(|backend| {
                SessionStore::new(backend, config)
                    .with_codec(codec.clone())
                    .with_clock(clock.clone())
            })
            .collect();
        Self::new(shards)
    }

    /// Replace the random source used for scan order.
    pub fn with_rng(self, rng: Box<dyn RngCore + Send>) -> Self {
        *self.rng.lock() = rng;
        self
    }

    /// Use a deterministic random source.
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_rng(Box::new(StdRng::seed_from_u64(seed)))
    }

    pub fn router(&self) -> PartitionRouter {
        self.router
    }

    pub fn partitions(&self) -> &[SessionStore] {
        &self.partitions
    }

    /// Shard responsible for `session_id`.
    pub fn partition_for(&self, session_id: &str) -> &SessionStore {
        &self.partitions[self.router.route(session_id)]
    }

    fn random_index(&self, len: usize) -> usize {
        self.rng.lock().random_range(0..len)
    }
}

impl ExpirableStore for PartitionedStore {
    fn get_expired_item_exclusive(
        &self,
        application: &str,
        signal_time: DateTime<Utc>,
    ) -> Result<Option<ExpiredSession>> {
        let count = self.partitions.len();
        let mut index = self.random_index(count);

        for _ in 0..count {
            let partition = &self.partitions[index];
            let candidates =
                partition.get_session_end_candidates(application, signal_time, PREFETCH_BATCH)?;
            trace!(partition = index, candidates = candidates.len(), "Scanned partition");

            if !candidates.is_empty()
                && let Some(claimed) =
                    claim_from_batch(partition, application, candidates, |len| {
                        self.random_index(len)
                    })?
            {
                return Ok(Some(claimed));
            }
            index = (index + 1) % count;
        }

        debug!(application = %application, "No claimable expired session in any partition");
        Ok(None)
    }

    fn remove_item(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
    ) -> Result<()> {
        self.partition_for(session_id)
            .remove_item(application, session_id, cookie)
    }
}

impl SessionStateStore for PartitionedStore {
    fn get_item(&self, application: &str, session_id: &str) -> Result<ReadOutcome> {
        self.partition_for(session_id).get_item(application, session_id)
    }

    fn get_item_exclusive(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
    ) -> Result<Option<ItemState>> {
        self.partition_for(session_id)
            .get_item_exclusive(application, session_id, cookie)
    }

    fn get_item_lock(&self, application: &str, session_id: &str) -> Result<LockStatus> {
        self.partition_for(session_id)
            .get_item_lock(application, session_id)
    }

    fn update_and_release_item(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
        flags: ActionFlags,
        item: &SessionItem,
    ) -> Result<()> {
        self.partition_for(session_id)
            .update_and_release_item(application, session_id, cookie, flags, item)
    }

    fn release_item(
        &self,
        application: &str,
        session_id: &str,
        cookie: &LockCookie,
    ) -> Result<()> {
        self.partition_for(session_id)
            .release_item(application, session_id, cookie)
    }

    fn insert_item(
        &self,
        application: &str,
        session_id: &str,
        flags: ActionFlags,
        item: &SessionItem,
    ) -> Result<()> {
        self.partition_for(session_id)
            .insert_item(application, session_id, flags, item)
    }

    fn update_item_expiration(
        &self,
        application: &str,
        session_id: &str,
        timeout_minutes: Option<u32>,
    ) -> Result<()> {
        self.partition_for(session_id)
            .update_item_expiration(application, session_id, timeout_minutes)
    }

    fn shard_count(&self) -> usize {
        self.partitions.len()
    }

    fn shard(&self, index: usize) -> Option<&SessionStore> {
        self.partitions.get(index)
    }

    fn now(&self) -> DateTime<Utc> {
        self.partitions[0].now()
    }
}
