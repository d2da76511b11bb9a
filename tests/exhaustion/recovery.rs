//! After pressure is released, recovery brings the subjects back to a usable
//! state within the configured number of cycles.

use crate::common::*;
use std::sync::Arc;
use std::time::Duration;
use strata_exhaustion::strata_core::{exclusive, HeapGauge, MIB};
use strata_exhaustion::strata_storage::{SqlLocation, SqlOptions, SqlSession, SqliteHeap};
use strata_exhaustion::{MemoryBudget, PressureConfig, Recovery, RecoveryConfig};

fn recovery() -> Recovery {
    Recovery::new(&RecoveryConfig {
        cycles: 3,
        pause_ms: 5,
    })
}

#[test]
fn test_release_returns_heap_and_runs_every_cycle() {
    let _session = exclusive();
    let heap = HeapGauge::new(32 * MIB);
    let mut budget =
        MemoryBudget::acquire(&heap, &PressureConfig::default(), recovery()).unwrap();

    let consumed = budget.consume(0.75).unwrap();
    assert!(consumed.reached_target());
    assert!(heap.charged() >= 24 * MIB);

    let report = budget.release();
    assert_eq!(report.cycles, 3);
    assert!(report.elapsed >= Duration::from_millis(15));
    assert!(report.elapsed < Duration::from_secs(5));
    assert_eq!(heap.charged(), 0);
    assert!(!MemoryBudget::is_active());
}

#[test]
fn test_sql_usable_after_exhaustion_and_recovery() {
    let _session = exclusive();
    init_logging();
    let heap = HeapGauge::new(16 * MIB);
    heap.register_probe(Arc::new(SqliteHeap));
    let location = SqlLocation::memory(unique("recover"));

    let mut db = SqlSession::open(location.clone(), &SqlOptions::new(), &heap).unwrap();
    let mut budget =
        MemoryBudget::acquire(&heap, &PressureConfig::default(), recovery()).unwrap();
    budget.consume(0.9).unwrap();

    let err = db
        .execute("CREATE TABLE big AS SELECT zeroblob(8 * 1024 * 1024) AS b")
        .unwrap_err();
    assert!(err.code().is_some(), "{}", err);

    budget.release();
    db.force_close();

    let mut db = SqlSession::open(location, &SqlOptions::new(), &heap).unwrap();
    assert_eq!(db.query_row_i64("SELECT 1").unwrap(), 1);
    db.close().unwrap();
    SqliteHeap::clear_hard_limit();
}

#[test]
fn test_second_budget_rejected_while_first_alive() {
    let _session = exclusive();
    let heap = HeapGauge::new(8 * MIB);
    let first = MemoryBudget::acquire(&heap, &PressureConfig::default(), recovery()).unwrap();
    assert!(MemoryBudget::acquire(&heap, &PressureConfig::default(), recovery()).is_err());
    drop(first);
    let second = MemoryBudget::acquire(&heap, &PressureConfig::default(), recovery()).unwrap();
    second.release();
}
