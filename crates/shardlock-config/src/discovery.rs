//! Config file discovery.
//!
//! The first match wins:
//! 1. An explicit path (`--config`)
//! 2. `SHARDLOCK_CONFIG`
//! 3. `./shardlock.toml`
//! 4. Built-in defaults

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{ConfigError, Result, ShardlockConfig};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "SHARDLOCK_CONFIG";

/// Default config filename for project-local config.
pub const PROJECT_CONFIG_FILE: &str = "shardlock.toml";

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    Explicit(PathBuf),
    Env(PathBuf),
    Project(PathBuf),
    Defaults,
}

impl ConfigOrigin {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Explicit(p) | Self::Env(p) | Self::Project(p) => Some(p),
            Self::Defaults => None,
        }
    }
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ShardlockConfig,
    pub origin: ConfigOrigin,
}

/// Discover and load configuration from the process environment and the
/// current directory.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let env_path = std::env::var(CONFIG_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    load_config_with_options(explicit, env_path.as_deref(), Path::new("."))
}

/// Discovery with every input explicit.
///
/// Explicit and environment paths must exist; a missing project file just
/// falls through to defaults.
pub fn load_config_with_options(
    explicit: Option<&Path>,
    env_path: Option<&Path>,
    project_dir: &Path,
) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        return Ok(LoadedConfig {
            config: load_config_file(path)?,
            origin: ConfigOrigin::Explicit(path.to_path_buf()),
        });
    }

    if let Some(path) = env_path {
        return Ok(LoadedConfig {
            config: load_config_file(path)?,
            origin: ConfigOrigin::Env(path.to_path_buf()),
        });
    }

    let project = project_dir.join(PROJECT_CONFIG_FILE);
    if project.is_file() {
        return Ok(LoadedConfig {
            config: load_config_file(&project)?,
            origin: ConfigOrigin::Project(project),
        });
    }

    debug!("No config file found, using defaults");
    Ok(LoadedConfig {
        config: ShardlockConfig::default(),
        origin: ConfigOrigin::Defaults,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<ShardlockConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!(path = %path.display(), "Loading config file");
    ShardlockConfig::from_toml(&contents)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn write(dir: &TempDir, name: &str, application: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, format!("[store]\napplication = \"{application}\"\n")).unwrap();
        path
    }

    #[test]
    fn test_explicit_path_wins() {
        let dir = TempDir::new().unwrap();
        let explicit = write(&dir, "explicit.toml", "from-explicit");
        let env = write(&dir, "env.toml", "from-env");
        write(&dir, PROJECT_CONFIG_FILE, "from-project");

        let loaded = load_config_with_options(Some(&explicit), Some(&env), dir.path()).unwrap();
        assert_eq!(loaded.config.store.application, "from-explicit");
        assert_eq!(loaded.origin, ConfigOrigin::Explicit(explicit));
    }

    #[test]
    fn test_env_before_project() {
        let dir = TempDir::new().unwrap();
        let env = write(&dir, "env.toml", "from-env");
        write(&dir, PROJECT_CONFIG_FILE, "from-project");

        let loaded = load_config_with_options(None, Some(&env), dir.path()).unwrap();
        assert_eq!(loaded.config.store.application, "from-env");
        assert_eq!(loaded.origin.path(), Some(env.as_path()));
    }

    #[test]
    fn test_project_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, PROJECT_CONFIG_FILE, "from-project");

        let loaded = load_config_with_options(None, None, dir.path()).unwrap();
        assert_eq!(loaded.config.store.application, "from-project");
        assert!(matches!(loaded.origin, ConfigOrigin::Project(_)));
    }

    #[test]
    fn test_defaults_when_nothing_found() {
        let dir = TempDir::new().unwrap();
        let loaded = load_config_with_options(None, None, dir.path()).unwrap();
        assert_eq!(loaded.origin, ConfigOrigin::Defaults);
        assert_eq!(loaded.config, ShardlockConfig::default());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = load_config_file(Path::new("/nonexistent/shardlock.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
