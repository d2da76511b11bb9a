//! Shared test utilities for the integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;
use strata_exhaustion::{HarnessConfig, RecoveryConfig, RunReport, Scenario, ScenarioRunner};
use strata_exhaustion::strata_core::MIB;
use tempfile::TempDir;

static INIT_LOGGING: Once = Once::new();

/// Install the fmt subscriber once per test binary
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        strata_exhaustion::logging::init_with_filter("strata=debug");
    });
}

/// Config rooted in a temp directory with the canonical scenario settings
pub fn canonical_config(temp: &TempDir) -> HarnessConfig {
    HarnessConfig {
        data_dir: temp.path().to_path_buf(),
        ..HarnessConfig::default()
    }
}

/// Canonical config scaled down so single-scenario tests stay quick
pub fn quick_config(temp: &TempDir) -> HarnessConfig {
    let mut config = canonical_config(temp);
    config.recovery = RecoveryConfig {
        cycles: 2,
        pause_ms: 5,
    };
    config.kv_bulk_write.heap_ceiling_mib = 48;
    config.kv_bulk_write.record_bytes = 4 * MIB as usize;
    config.kv_bulk_write.autocommit_bytes = 16 * MIB as usize;
    config
}

/// Run exactly one scenario
pub fn run_one(config: HarnessConfig, scenario: impl Scenario + 'static) -> RunReport {
    init_logging();
    ScenarioRunner::new(config, vec![Box::new(scenario)])
        .expect("valid config")
        .run()
}

/// Entries left under a directory
pub fn leftovers(dir: &std::path::Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Unique name for an ad-hoc backing store
pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}
