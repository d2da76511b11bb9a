//! Nothing survives a scenario: stores, budgets and allocator limits are all
//! reset whether the scenario passed or not.

use crate::common::*;
use strata_exhaustion::strata_storage::SqliteHeap;
use strata_exhaustion::{MemoryBudget, NearExhaustionUpdate, SqlBulkMaterialize};
use tempfile::TempDir;

#[test]
fn test_file_store_deleted_after_pass() {
    let temp = TempDir::new().unwrap();
    let report = run_one(quick_config(&temp), NearExhaustionUpdate);
    assert!(report.is_success(), "{}", report.to_json().unwrap());
    assert!(leftovers(temp.path()).is_empty(), "{:?}", leftovers(temp.path()));
}

#[test]
fn test_file_store_deleted_after_failure() {
    let temp = TempDir::new().unwrap();
    let mut config = quick_config(&temp);
    config.near_exhaustion_update.heap_ceiling_mib = 256;
    config.near_exhaustion_update.pressure_fraction = 0.0;
    let report = run_one(config, NearExhaustionUpdate);
    assert!(!report.is_success());
    assert!(leftovers(temp.path()).is_empty(), "{:?}", leftovers(temp.path()));

    let _session = strata_exhaustion::strata_core::exclusive();
    assert!(!MemoryBudget::is_active());
}

#[test]
fn test_limits_and_budget_released_after_run() {
    let temp = TempDir::new().unwrap();
    run_one(quick_config(&temp), SqlBulkMaterialize);

    let _session = strata_exhaustion::strata_core::exclusive();
    assert_eq!(SqliteHeap::hard_limit(), 0);
    assert!(!MemoryBudget::is_active());
}

#[test]
fn test_repeated_runs_are_independent() {
    let temp = TempDir::new().unwrap();
    let first = run_one(quick_config(&temp), NearExhaustionUpdate);
    let second = run_one(quick_config(&temp), NearExhaustionUpdate);
    assert!(first.is_success());
    assert!(second.is_success());
}
