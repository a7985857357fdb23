//! Runtime configuration file format: the database file sets to register at
//! startup, per-opcode timeouts, external-mem cache sizing, and logging
//! level.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;

/// One database to register with `acdb-registry` at startup, matching the
/// `(workspace, acdb_path, writable_dir)` triple a real deployment passes to
/// `add_database`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseEntry {
    /// Human-readable name, used only in logs and CLI output.
    pub name: String,
    /// Directory the chunked `.acdb` file and any delta files live under.
    pub workspace: PathBuf,
    /// Path to the chunked database file within `workspace`.
    pub acdb_path: PathBuf,
    /// Directory delta writes are persisted to; defaults to the global
    /// `writable_dir` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable_dir: Option<PathBuf>,
}

/// Per-opcode timeouts, in milliseconds, mirroring `acdb-graph::Timeouts`.
/// Kept as plain integers here so this crate does not need to depend on
/// `acdb-graph`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutsMs {
    /// OPEN/CLOSE timeout, milliseconds.
    pub open_close_ms: u64,
    /// START/STOP timeout, milliseconds.
    pub start_stop_ms: u64,
    /// Generic (SET_CFG/GET_CFG/FLUSH/...) timeout, milliseconds.
    pub generic_ms: u64,
}

impl Default for TimeoutsMs {
    fn default() -> Self {
        Self {
            open_close_ms: 5_000,
            start_stop_ms: 2_000,
            generic_ms: 500,
        }
    }
}

/// Top-level runtime configuration, loaded from `acdb.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Databases to register at startup, in order.
    #[serde(default)]
    pub databases: Vec<DatabaseEntry>,

    /// Default writable directory used by any [`DatabaseEntry`] that does
    /// not specify its own.
    #[serde(default = "paths::default_writable_dir")]
    pub writable_dir: PathBuf,

    /// Per-opcode timeouts applied to every graph.
    #[serde(default)]
    pub timeouts: TimeoutsMs,

    /// Capacity of the external-memory cache (C8). The source caps this at
    /// 32 since the availability bitmask is a single `u32`; values above 32
    /// are rejected by [`RuntimeConfig::validate`].
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// `tracing` filter directive, e.g. `"info"` or `"acdb_io=debug,warn"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cache_capacity() -> usize {
    32
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            writable_dir: paths::default_writable_dir(),
            timeouts: TimeoutsMs::default(),
            cache_capacity: default_cache_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes and writes this configuration to `path`, creating parent
    /// directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            paths::ensure_dir(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
    }

    /// Rejects configurations the rest of the runtime cannot honor: a cache
    /// capacity above 32 (the availability bitmask is a single `u32`) or a
    /// database entry with an empty name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity > 32 {
            return Err(ConfigError::Invalid(format!(
                "cache_capacity {} exceeds the 32-slot bitmask limit",
                self.cache_capacity
            )));
        }
        for db in &self.databases {
            if db.name.is_empty() {
                return Err(ConfigError::Invalid("database entry missing a name".to_string()));
            }
        }
        Ok(())
    }

    /// Resolves the writable directory for `entry`: its own, or this
    /// config's global default.
    pub fn writable_dir_for(&self, entry: &DatabaseEntry) -> PathBuf {
        entry.writable_dir.clone().unwrap_or_else(|| self.writable_dir.clone())
    }
}
