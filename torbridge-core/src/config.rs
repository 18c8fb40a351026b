//! Bridge configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.torbridge/
//!   config.yaml   (optional, every field has a default)
//! ```
//!
//! Like the registry helpers elsewhere in the workspace, loading has two forms:
//! `load_at(home)` for an explicit home (tests) and `load()` which derives it
//! from `dirs::home_dir()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, BridgeError};

/// The port the mobile hosts historically hard-coded.
pub const DEFAULT_SOCKS_PORT: u16 = 19032;
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Local SOCKS port the daemon binds and requests/streams go through.
    pub socks_port: u16,
    /// Writable directory for the daemon's working state.
    pub work_dir: PathBuf,
    pub startup_timeout_ms: u64,
    pub client_timeout_secs: u64,
    /// `tor` executable used by the process backend.
    pub tor_binary: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socks_port: DEFAULT_SOCKS_PORT,
            work_dir: std::env::temp_dir().join("torbridge"),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            client_timeout_secs: DEFAULT_CLIENT_TIMEOUT_SECS,
            tor_binary: PathBuf::from("tor"),
        }
    }
}

impl BridgeConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    /// `<home>/.torbridge/config.yaml`. Pure, no I/O.
    pub fn path_at(home: &Path) -> PathBuf {
        home.join(".torbridge").join("config.yaml")
    }

    /// Load from `<home>/.torbridge/config.yaml`, or defaults if absent.
    pub fn load_at(home: &Path) -> Result<Self, BridgeError> {
        Self::load_file(&Self::path_at(home))
    }

    /// Load an explicit file. Missing file means defaults.
    pub fn load_file(path: &Path) -> Result<Self, BridgeError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_yaml::from_str(&contents).map_err(|source| BridgeError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `load_at` convenience wrapper. Falls back to defaults without a home.
    pub fn load() -> Result<Self, BridgeError> {
        match dirs::home_dir() {
            Some(home) => Self::load_at(&home),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().expect("tempdir");
        let config = BridgeConfig::load_at(home.path()).expect("load");
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.socks_port, 19032);
        assert_eq!(config.client_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let home = TempDir::new().expect("tempdir");
        let path = BridgeConfig::path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(&path, "socks_port: 29050\n").expect("write");

        let config = BridgeConfig::load_at(home.path()).expect("load");
        assert_eq!(config.socks_port, 29050);
        assert_eq!(config.startup_timeout_ms, DEFAULT_STARTUP_TIMEOUT_MS);
    }
}
