//! Opening the configured backends.

use std::sync::Arc;

use shardlock_store::{
    MemoryBackend, SessionBackend, SessionStateStore, SqliteBackend, StoreConfig,
    build_default_store,
};
use tracing::info;

use crate::{BackendKind, BackendSection, Result, ShardlockConfig};

/// Open one backend per partition.
pub fn open_backends(
    section: &BackendSection,
    partitions: usize,
) -> Result<Vec<Arc<dyn SessionBackend>>> {
    match section.kind {
        BackendKind::Memory => Ok((0..partitions)
            .map(|_| Arc::new(MemoryBackend::new()) as Arc<dyn SessionBackend>)
            .collect()),
        BackendKind::Sqlite => section
            .sqlite_paths(partitions)?
            .into_iter()
            .enumerate()
            .map(|(partition, path)| -> Result<Arc<dyn SessionBackend>> {
                info!(partition, path = %path.display(), "Opening sqlite shard");
                let backend = SqliteBackend::open(&path)?;
                Ok(Arc::new(backend) as Arc<dyn SessionBackend>)
            })
            .collect(),
    }
}

/// Validate the config and open the store it describes.
pub fn open_store(config: &ShardlockConfig) -> Result<(StoreConfig, Arc<dyn SessionStateStore>)> {
    let store_config = config.store_config()?;
    let backends = open_backends(&config.backend, store_config.effective_partitions())?;
    let store = build_default_store(&store_config, backends)?;
    Ok((store_config, store))
}
