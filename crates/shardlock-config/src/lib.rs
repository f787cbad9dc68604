//! Configuration for shardlock.
//!
//! Provides a TOML schema with `[store]`, `[backend]` and `[logging]`
//! sections, file discovery, and helpers that turn a loaded config into an
//! open session store.

pub mod backend;
pub mod discovery;
pub mod error;
pub mod types;

pub use backend::{open_backends, open_store};
pub use discovery::{
    CONFIG_ENV, ConfigOrigin, LoadedConfig, PROJECT_CONFIG_FILE, load_config, load_config_file,
    load_config_with_options,
};
pub use error::{ConfigError, Result};
pub use types::*;
