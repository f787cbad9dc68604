//! Partitioned session state store.
//!
//! Sessions are keyed by `(application, session_id)` and live in one or more
//! backend shards. Writers coordinate through lock cookies enforced by the
//! backend's conditional writes, and expired sessions are drained by a
//! single elected sweeper per session type.
//!
//! # Example
//!
//! ```rust,ignore
//! use shardlock_store::{
//!     MemoryBackend, NoopSessionEndSink, SessionStateProvider, StoreConfig,
//!     SweeperCoordinator, build_default_store,
//! };
//!
//! let config = StoreConfig::new()
//!     .with_application("shop")
//!     .with_partition_count(4);
//! let backends = (0..4).map(|_| Arc::new(MemoryBackend::new()) as _).collect();
//! let store = build_default_store(&config, backends)?;
//!
//! let provider = SessionStateProvider::open(
//!     config,
//!     store,
//!     Arc::new(NoopSessionEndSink),
//!     SweeperCoordinator::global(),
//! )?;
//! provider.create_uninitialized_item("abc", 20)?;
//! ```

pub mod backend;
mod clock;
mod codec;
mod config;
mod cookie;
mod coordinator;
mod error;
mod partitioned;
mod provider;
mod record;
mod router;
mod store;
mod sweeper;

pub use backend::{
    LockMatch, MemoryBackend, Precondition, SessionBackend, SessionUpdate, SqliteBackend,
    WriteConcern, WriteCounts,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{FramedCodec, PayloadCodec};
pub use config::{
    DEFAULT_POLLING_INTERVAL, DEFAULT_TIMEOUT_MINUTES, MAX_PARTITIONS,
    POLLING_INTERVAL_RANGE_SECS, StoreConfig,
};
pub use cookie::LockCookie;
pub use coordinator::{InstanceId, SweeperCoordinator, TimerControl};
pub use error::{Result, StoreError};
pub use partitioned::PartitionedStore;
pub use provider::{
    ExclusiveRead, ItemRead, SessionStateProvider, build_default_store, build_store,
};
pub use record::{ActionFlags, SessionEndCandidate, SessionItem, SessionKey, SessionRecord};
pub use router::{PartitionRouter, route, session_hash};
pub use store::{
    EXPIRED_LOCK_GRACE, ExpirableStore, ExpiredSession, ItemState, LockStatus, PREFETCH_BATCH,
    ReadOutcome, SessionStateStore, SessionStore,
};
pub use sweeper::{
    ExpirationSweeper, NoopSessionEndSink, SessionEndSink, SinkError, SweepReport, SweepState,
    SweepTimer,
};
