//! Configuration file management for coordinator.
//!
//! Provides a TOML-based config file at `~/.config/coordinator/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use coordinator_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Seconds without a heartbeat before a worker is considered dead.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Seconds between heartbeats sent by a worker process.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Path to the backlog YAML file to ingest on `db-init`/`serve` startup.
    #[serde(default = "default_backlog_path")]
    pub backlog_path: String,
    /// Isolation backend for worker workspaces ("worktree" is the only one shipped).
    #[serde(default = "default_isolation_mode")]
    pub isolation_mode: String,
}

fn default_agent_timeout_secs() -> u64 {
    180
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_backlog_path() -> String {
    "backlog.yaml".to_string()
}

fn default_isolation_mode() -> String {
    "worktree".to_string()
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            agent_timeout_secs: default_agent_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            backlog_path: default_backlog_path(),
            isolation_mode: default_isolation_mode(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the coordinator config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/coordinator` or `~/.config/coordinator`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("coordinator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("coordinator")
}

/// Return the path to the coordinator config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct CoordinatorConfig {
    pub db_config: DbConfig,
    pub agent_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub backlog_path: String,
    pub isolation_mode: String,
}

impl CoordinatorConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `COORDINATOR_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Worker settings: config file values, falling back to the compiled defaults.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("COORDINATOR_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let worker = file_config.map(|c| c.worker).unwrap_or_default();

        Ok(Self {
            db_config,
            agent_timeout_secs: worker.agent_timeout_secs,
            heartbeat_interval_secs: worker.heartbeat_interval_secs,
            backlog_path: worker.backlog_path,
            isolation_mode: worker.isolation_mode,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("coordinator");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection { url: "postgresql://testhost:5432/testdb".to_string() },
            worker: WorkerSection::default(),
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.worker.agent_timeout_secs, original.worker.agent_timeout_secs);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();

        unsafe { std::env::set_var("COORDINATOR_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = CoordinatorConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("COORDINATOR_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();

        unsafe { std::env::set_var("COORDINATOR_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = CoordinatorConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("COORDINATOR_DATABASE_URL") };
    }

    #[test]
    fn resolve_defaults_db_url_and_worker_settings_when_nothing_set() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("COORDINATOR_DATABASE_URL") };

        let config = CoordinatorConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.agent_timeout_secs, 180);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("coordinator/config.toml"), "unexpected config path: {}", path.display());
    }
}
