//! Harness configuration via `strata-exhaustion.toml`
//!
//! Every section is optional; missing keys fall back to the defaults below,
//! which reproduce the canonical run. Heap ceilings are given in MiB and are
//! per scenario: each scenario runs against a fresh gauge of its own size.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_core::MIB;
use thiserror::Error;

/// Conventional config file name
pub const CONFIG_FILE_NAME: &str = "strata-exhaustion.toml";

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The config file could not be written
    #[error("failed to write config file '{}': {source}", path.display())]
    Write {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The TOML did not parse
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// `[pressure]`: how the memory budget consumes the heap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Size of each opaque block, in bytes
    pub block_bytes: usize,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            block_bytes: MIB as usize,
        }
    }
}

/// `[recovery]`: the bounded reclamation wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Reclamation cycles per recovery
    pub cycles: u32,
    /// Pause after each cycle, in milliseconds
    pub pause_ms: u64,
}

impl RecoveryConfig {
    /// Pause after each cycle
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cycles: 5,
            pause_ms: 20,
        }
    }
}

/// `[kv_bulk_write]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvBulkWriteConfig {
    /// Heap ceiling for the scenario, in MiB
    pub heap_ceiling_mib: u64,
    /// Size of each randomized record, in bytes
    pub record_bytes: usize,
    /// Insertions attempted before the run counts as silent success
    pub max_records: u32,
    /// Seed for the payload generator
    pub seed: u64,
    /// Staged bytes at which an insert commits on the caller's thread
    pub autocommit_bytes: usize,
    /// Background commit period, in milliseconds
    pub autocommit_delay_ms: u64,
}

impl Default for KvBulkWriteConfig {
    fn default() -> Self {
        Self {
            heap_ceiling_mib: 96,
            record_bytes: 10 * MIB as usize,
            max_records: 100,
            seed: 1,
            autocommit_bytes: 32 * MIB as usize,
            autocommit_delay_ms: 50,
        }
    }
}

/// `[sql_bulk_materialize]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlBulkMaterializeConfig {
    /// Heap ceiling for the scenario, in MiB
    pub heap_ceiling_mib: u64,
    /// Rows generated by the single statement
    pub rows: u32,
    /// Base length of each generated string; row `x` gets `row_chars + x`
    pub row_chars: u64,
}

impl Default for SqlBulkMaterializeConfig {
    fn default() -> Self {
        Self {
            heap_ceiling_mib: 64,
            rows: 1000,
            row_chars: 10_000_000,
        }
    }
}

/// `[near_exhaustion_update]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NearExhaustionUpdateConfig {
    /// Heap ceiling for the scenario, in MiB
    pub heap_ceiling_mib: u64,
    /// Rows inserted before the update
    pub rows: u32,
    /// Leading spaces in each initial row
    pub base_chars: u32,
    /// Spaces appended by each growth update
    pub growth_chars: u32,
    /// Heap occupancy to reach before the update under pressure
    pub pressure_fraction: f64,
    /// SQLite page cache ceiling, in KiB; dirty pages never spill
    pub operation_memory_kib: u32,
}

impl Default for NearExhaustionUpdateConfig {
    fn default() -> Self {
        Self {
            heap_ceiling_mib: 8,
            rows: 3000,
            base_chars: 100,
            growth_chars: 1000,
            pressure_fraction: 0.8,
            operation_memory_kib: 1024,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::temp_dir().join("strata-oom")
}

/// Harness configuration loaded from `strata-exhaustion.toml`
///
/// # Example
///
/// ```toml
/// data_dir = "/tmp/strata-oom"
///
/// [near_exhaustion_update]
/// heap_ceiling_mib = 8
/// pressure_fraction = 0.8
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Parent directory for file-backed scenario stores
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Memory budget settings
    #[serde(default)]
    pub pressure: PressureConfig,
    /// Recovery protocol settings
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Bulk-write exhaustion on the key-value store
    #[serde(default)]
    pub kv_bulk_write: KvBulkWriteConfig,
    /// Bulk materialization via one SQL statement
    #[serde(default)]
    pub sql_bulk_materialize: SqlBulkMaterializeConfig,
    /// Incremental update near exhaustion
    #[serde(default)]
    pub near_exhaustion_update: NearExhaustionUpdateConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            pressure: PressureConfig::default(),
            recovery: RecoveryConfig::default(),
            kv_bulk_write: KvBulkWriteConfig::default(),
            sql_bulk_materialize: SqlBulkMaterializeConfig::default(),
            near_exhaustion_update: NearExhaustionUpdateConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Returns the default config file content with comments.
    ///
    /// `data_dir` is left out so it follows the platform temp directory.
    pub fn default_toml() -> &'static str {
        r#"# Strata exhaustion harness configuration
#
# Parent directory for file-backed scenario stores (default: <tmp>/strata-oom)
# data_dir = "/tmp/strata-oom"

[pressure]
# Size of each block the memory budget holds
block_bytes = 1048576

[recovery]
# Reclamation cycles per recovery, each followed by a pause
cycles = 5
pause_ms = 20

[kv_bulk_write]
heap_ceiling_mib = 96
record_bytes = 10485760
max_records = 100
seed = 1
autocommit_bytes = 33554432
autocommit_delay_ms = 50

[sql_bulk_materialize]
heap_ceiling_mib = 64
rows = 1000
row_chars = 10000000

[near_exhaustion_update]
heap_ceiling_mib = 8
rows = 3000
base_chars = 100
growth_chars = 1000
pressure_fraction = 0.8
operation_memory_kib = 1024
"#
    }

    /// Parse config from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate config from a file path
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize this config to TOML and write it to the given path
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every value is in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        let block = self.pressure.block_bytes as u64;
        if block == 0 {
            return Err(ConfigError::Invalid("pressure.block_bytes must be non-zero".into()));
        }
        if self.recovery.cycles == 0 {
            return Err(ConfigError::Invalid("recovery.cycles must be at least 1".into()));
        }

        let ceilings = [
            ("kv_bulk_write", self.kv_bulk_write.heap_ceiling_mib),
            ("sql_bulk_materialize", self.sql_bulk_materialize.heap_ceiling_mib),
            ("near_exhaustion_update", self.near_exhaustion_update.heap_ceiling_mib),
        ];
        for (section, mib) in ceilings {
            if mib == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}.heap_ceiling_mib must be non-zero",
                    section
                )));
            }
            if block > mib.saturating_mul(MIB) {
                return Err(ConfigError::Invalid(format!(
                    "pressure.block_bytes ({}) exceeds {}.heap_ceiling_mib ({} MiB)",
                    block, section, mib
                )));
            }
        }

        let kv = &self.kv_bulk_write;
        if kv.record_bytes == 0 || kv.max_records == 0 || kv.autocommit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "kv_bulk_write.record_bytes, max_records and autocommit_bytes must be non-zero"
                    .into(),
            ));
        }

        let sql = &self.sql_bulk_materialize;
        if sql.rows == 0 || sql.row_chars == 0 {
            return Err(ConfigError::Invalid(
                "sql_bulk_materialize.rows and row_chars must be non-zero".into(),
            ));
        }

        let update = &self.near_exhaustion_update;
        if update.rows == 0 || update.growth_chars == 0 {
            return Err(ConfigError::Invalid(
                "near_exhaustion_update.rows and growth_chars must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&update.pressure_fraction) {
            return Err(ConfigError::Invalid(format!(
                "near_exhaustion_update.pressure_fraction must be within 0..=1, got {}",
                update.pressure_fraction
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_toml_matches_default() {
        let parsed = HarnessConfig::from_toml_str(HarnessConfig::default_toml()).unwrap();
        assert_eq!(parsed, HarnessConfig::default());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config = HarnessConfig::from_toml_str(
            r#"
            [near_exhaustion_update]
            pressure_fraction = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.near_exhaustion_update.pressure_fraction, 0.5);
        assert_eq!(config.near_exhaustion_update.rows, 3000);
        assert_eq!(config.kv_bulk_write, KvBulkWriteConfig::default());
        assert_eq!(config.recovery.pause(), Duration::from_millis(20));
    }

    #[test]
    fn test_write_and_read_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        let mut config = HarnessConfig::default();
        config.data_dir = temp.path().join("data");
        config.kv_bulk_write.seed = 42;
        config.write_to_file(&path).unwrap();

        let loaded = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let temp = TempDir::new().unwrap();
        let err = HarnessConfig::from_file(&temp.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = HarnessConfig::from_toml_str("[recovery\ncycles = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_fraction_out_of_range_rejected() {
        let mut config = HarnessConfig::default();
        config.near_exhaustion_update.pressure_fraction = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pressure_fraction"));
    }

    #[test]
    fn test_block_larger_than_ceiling_rejected() {
        let mut config = HarnessConfig::default();
        config.pressure.block_bytes = 16 * MIB as usize;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("near_exhaustion_update"));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = HarnessConfig::default();
        config.kv_bulk_write.record_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.recovery.cycles = 0;
        assert!(config.validate().is_err());
    }
}
