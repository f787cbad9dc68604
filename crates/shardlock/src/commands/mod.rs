//! CLI command handlers.

pub mod expired;
pub mod inspect;
pub mod route;
pub mod sweep;

use shardlock_config::ShardlockConfig;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Resolved configuration.
    pub config: ShardlockConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}
