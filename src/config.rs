//! Configuration for quest-sync-core

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quest-sync")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for the quest index database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Short code length in characters
    #[serde(default = "default_short_code_len")]
    pub short_code_len: usize,

    /// Timeout for a single store round-trip, in seconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,

    /// Timeout for ledger confirmation, in seconds. Distinct from the
    /// store timeout: ledger confirmation can legitimately take much
    /// longer than a store round-trip.
    #[serde(default = "default_ledger_timeout")]
    pub ledger_timeout_secs: u64,

    /// Reconciliation interval in seconds (retry pending/unconfirmed writes)
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Maximum ambiguous-code candidates surfaced to the caller
    #[serde(default = "default_max_candidates")]
    pub max_ambiguous_candidates: usize,
}

fn default_short_code_len() -> usize {
    crate::codec::SHORT_CODE_LEN
}

fn default_store_timeout() -> u64 {
    10
}

fn default_ledger_timeout() -> u64 {
    120
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_max_candidates() -> usize {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            short_code_len: default_short_code_len(),
            store_timeout_secs: default_store_timeout(),
            ledger_timeout_secs: default_ledger_timeout(),
            reconcile_interval_secs: default_reconcile_interval(),
            max_ambiguous_candidates: default_max_candidates(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Get index database path
    pub fn index_db_path(&self) -> PathBuf {
        self.data_dir.join("index.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: Config = toml::from_str("short_code_len = 10").unwrap();
        assert_eq!(config.short_code_len, 10);
        assert_eq!(config.ledger_timeout_secs, default_ledger_timeout());
        assert!(config.ledger_timeout() > config.store_timeout());
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::default();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.short_code_len, config.short_code_len);
        assert_eq!(loaded.reconcile_interval_secs, config.reconcile_interval_secs);
    }
}
