//! Request-path facade: one provider instance per worker.
//!
//! A provider owns a store handle and, when expiration is enabled, a sweep
//! timer that it registers with a [`SweeperCoordinator`]. Lock contention is
//! reported as data ([`ExclusiveRead::Locked`]) rather than an error.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::backend::SessionBackend;
use crate::clock::{Clock, SystemClock};
use crate::codec::{FramedCodec, PayloadCodec};
use crate::config::StoreConfig;
use crate::coordinator::{InstanceId, SweeperCoordinator, TimerControl};
use crate::cookie::LockCookie;
use crate::error::{Result, StoreError};
use crate::partitioned::PartitionedStore;
use crate::record::{ActionFlags, SessionItem};
use crate::store::{ItemState, LockStatus, ReadOutcome, SessionStateStore, SessionStore};
use crate::sweeper::{ExpirationSweeper, SessionEndSink, SweepTimer};

/// Result of a shared read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemRead {
    Missing,
    Locked { cookie: LockCookie, lock_age: Duration },
    Available(ItemState),
}

/// Result of an exclusive read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusiveRead {
    /// The lock is ours; present `cookie` to write or release.
    Acquired { state: ItemState, cookie: LockCookie },
    Locked { cookie: LockCookie, lock_age: Duration },
    /// The session exists but its lock changed hands on every attempt.
    /// Retry later; never treat this as missing.
    Busy,
    Missing,
}

/// Acquisition attempts before [`ExclusiveRead::Busy`] is reported.
const ACQUIRE_ATTEMPTS: usize = 3;

/// Build the store described by `config`: a plain [`SessionStore`] for an
/// unpartitioned configuration, a [`PartitionedStore`] otherwise. Expects
/// exactly one backend per partition.
pub fn build_store(
    config: &StoreConfig,
    backends: Vec<Arc<dyn SessionBackend>>,
    codec: Arc<dyn PayloadCodec>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn SessionStateStore>> {
    config.validate()?;
    let expected = config.effective_partitions();
    if backends.len() != expected {
        return Err(StoreError::Configuration(format!(
            "expected {expected} backend(s) for {} partition(s), got {}",
            config.partition_count,
            backends.len()
        )));
    }

    if config.is_partitioned() {
        let store = PartitionedStore::from_backends(backends, config, codec, clock)?;
        return Ok(Arc::new(store));
    }

    let Some(backend) = backends.into_iter().next() else {
        return Err(StoreError::Configuration("no backend configured".to_string()));
    };
    Ok(Arc::new(
        SessionStore::new(backend, config)
            .with_codec(codec)
            .with_clock(clock),
    ))
}

/// Same as [`build_store`] with the default codec and the system clock.
pub fn build_default_store(
    config: &StoreConfig,
    backends: Vec<Arc<dyn SessionBackend>>,
) -> Result<Arc<dyn SessionStateStore>> {
    build_store(
        config,
        backends,
        Arc::new(FramedCodec),
        Arc::new(SystemClock),
    )
}

/// Reads time from the store, so sweeps share the clock the store was
/// built with.
struct StoreClock(Arc<dyn SessionStateStore>);

impl Clock for StoreClock {
    fn now(&self) -> DateTime<Utc> {
        self.0.now()
    }
}

/// One provider instance.
pub struct SessionStateProvider {
    config: StoreConfig,
    store: Arc<dyn SessionStateStore>,
    coordinator: Arc<SweeperCoordinator>,
    timer: Option<Arc<SweepTimer>>,
    instance: Mutex<Option<InstanceId>>,
}

impl std::fmt::Debug for SessionStateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateProvider")
            .field("application", &self.config.application)
            .field("session_type", &self.config.session_type)
            .field("instance", &*self.instance.lock())
            .finish_non_exhaustive()
    }
}

impl SessionStateProvider {
    /// Validate `config`, register with `coordinator` and start sweeping if
    /// elected.
    ///
    /// With expiration enabled this must be called inside a tokio runtime;
    /// the sweep timer runs on it.
    pub fn open(
        config: StoreConfig,
        store: Arc<dyn SessionStateStore>,
        sink: Arc<dyn SessionEndSink>,
        coordinator: Arc<SweeperCoordinator>,
    ) -> Result<Self> {
        config.validate()?;

        let timer = if config.expiration_enabled {
            let runtime = Handle::try_current().map_err(|e| {
                StoreError::Configuration(format!(
                    "expiration sweeping needs a tokio runtime: {e}"
                ))
            })?;
            let sweeper =
                ExpirationSweeper::new(config.application.clone(), store.clone(), sink)
                    .with_clock(Arc::new(StoreClock(store.clone())));
            Some(Arc::new(SweepTimer::new(
                Arc::new(sweeper),
                config.polling_interval,
                runtime,
            )))
        } else {
            None
        };

        let control = timer
            .clone()
            .map(|timer| timer as Arc<dyn TimerControl>);
        let instance = coordinator.register(&config.session_type, control);
        info!(
            %instance,
            application = %config.application,
            partitions = store.shard_count(),
            leader = coordinator.is_enabled(instance),
            "Session state provider opened"
        );

        Ok(Self {
            config,
            store,
            coordinator,
            timer,
            instance: Mutex::new(Some(instance)),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStateStore> {
        &self.store
    }

    /// `None` once shut down.
    pub fn instance_id(&self) -> Option<InstanceId> {
        *self.instance.lock()
    }

    /// Whether this instance currently runs the sweep for its session type.
    pub fn is_sweep_leader(&self) -> bool {
        self.instance_id()
            .is_some_and(|id| self.coordinator.is_enabled(id))
    }

    pub fn sweeper(&self) -> Option<&Arc<ExpirationSweeper>> {
        self.timer.as_ref().map(|timer| timer.sweeper())
    }

    fn app(&self) -> &str {
        &self.config.application
    }

    fn locked(&self, cookie: LockCookie) -> (LockCookie, Duration) {
        let lock_age = cookie.age(self.store.now());
        (cookie, lock_age)
    }

    pub fn get_item(&self, session_id: &str) -> Result<ItemRead> {
        Ok(match self.store.get_item(self.app(), session_id)? {
            ReadOutcome::Missing => ItemRead::Missing,
            ReadOutcome::Locked(cookie) => {
                let (cookie, lock_age) = self.locked(cookie);
                ItemRead::Locked { cookie, lock_age }
            }
            ReadOutcome::Available(state) => ItemRead::Available(state),
        })
    }

    /// Try to take the session's lock.
    ///
    /// On contention the lock is read back to tell "held by someone" from
    /// "gone". If it was released in between, acquisition is retried, up to
    /// a bounded number of times.
    pub fn get_item_exclusive(&self, session_id: &str) -> Result<ExclusiveRead> {
        for attempt in 0..ACQUIRE_ATTEMPTS {
            let cookie = LockCookie::new(self.store.now());
            if let Some(state) = self
                .store
                .get_item_exclusive(self.app(), session_id, &cookie)?
            {
                return Ok(ExclusiveRead::Acquired { state, cookie });
            }

            match self.store.get_item_lock(self.app(), session_id)? {
                LockStatus::Missing => return Ok(ExclusiveRead::Missing),
                LockStatus::Locked(held) => {
                    let (cookie, lock_age) = self.locked(held);
                    return Ok(ExclusiveRead::Locked { cookie, lock_age });
                }
                LockStatus::Unlocked => {
                    debug!(session_id = %session_id, attempt, "Lock released during acquisition");
                }
            }
        }
        debug!(session_id = %session_id, "Lock acquisition kept losing to short-lived holders");
        Ok(ExclusiveRead::Busy)
    }

    /// Store `item` and release the lock. New items are inserted; existing
    /// ones are written only if `cookie` still holds the lock.
    pub fn set_and_release_item_exclusive(
        &self,
        session_id: &str,
        item: &SessionItem,
        cookie: &LockCookie,
        new_item: bool,
    ) -> Result<()> {
        if new_item {
            self.store
                .insert_item(self.app(), session_id, ActionFlags::NONE, item)
        } else {
            self.store.update_and_release_item(
                self.app(),
                session_id,
                cookie,
                ActionFlags::NONE,
                item,
            )
        }
    }

    pub fn release_item_exclusive(&self, session_id: &str, cookie: &LockCookie) -> Result<()> {
        self.store.release_item(self.app(), session_id, cookie)
    }

    pub fn remove_item(&self, session_id: &str, cookie: &LockCookie) -> Result<()> {
        self.store.remove_item(self.app(), session_id, cookie)
    }

    /// Insert an empty, unlocked session flagged as uninitialized.
    pub fn create_uninitialized_item(&self, session_id: &str, timeout_minutes: u32) -> Result<()> {
        self.store.insert_item(
            self.app(),
            session_id,
            ActionFlags::UNINITIALIZED,
            &SessionItem::empty(timeout_minutes),
        )
    }

    /// Slide the session's expiry using its stored timeout.
    pub fn reset_item_timeout(&self, session_id: &str) -> Result<()> {
        self.store
            .update_item_expiration(self.app(), session_id, None)
    }

    pub fn create_new_store_data(&self, timeout_minutes: u32) -> SessionItem {
        SessionItem::empty(timeout_minutes)
    }

    /// Stop sweeping here and leave the coordinator, handing the timer to
    /// another instance. Idempotent.
    pub fn shutdown(&self) {
        let Some(instance) = self.instance.lock().take() else {
            return;
        };
        if let Some(timer) = &self.timer {
            timer.stop();
        }
        match self.coordinator.unregister(instance) {
            Some(successor) => info!(%instance, %successor, "Provider shut down, sweep handed off"),
            None => info!(%instance, "Provider shut down"),
        }
    }
}

impl Drop for SessionStateProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}
