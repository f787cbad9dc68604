//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shardlock_store::{
    FramedCodec, ManualClock, MemoryBackend, SessionBackend, SessionStateStore, SqliteBackend,
    StoreConfig, build_store,
};
use tempfile::TempDir;

pub const APP: &str = "shop";

#[derive(Debug, Clone, Copy)]
pub enum BackendKind {
    Memory,
    Sqlite,
}

pub const ALL_KINDS: [BackendKind; 2] = [BackendKind::Memory, BackendKind::Sqlite];

/// Backends plus the temp directory their database files live in.
pub struct Backends {
    pub dir: TempDir,
    pub backends: Vec<Arc<dyn SessionBackend>>,
}

pub fn backends(kind: BackendKind, count: usize) -> Backends {
    let dir = tempfile::tempdir().unwrap();
    let backends = (0..count)
        .map(|i| -> Arc<dyn SessionBackend> {
            match kind {
                BackendKind::Memory => Arc::new(MemoryBackend::new()),
                BackendKind::Sqlite => Arc::new(
                    SqliteBackend::open(dir.path().join(format!("sessions-{i}.db"))).unwrap(),
                ),
            }
        })
        .collect();
    Backends { dir, backends }
}

/// Current time at millisecond precision, as every backend stores it.
pub fn now_millis() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(now_millis()))
}

pub fn store(
    config: &StoreConfig,
    backends: &Backends,
    clock: &Arc<ManualClock>,
) -> Arc<dyn SessionStateStore> {
    build_store(
        config,
        backends.backends.clone(),
        Arc::new(FramedCodec),
        clock.clone(),
    )
    .unwrap()
}
