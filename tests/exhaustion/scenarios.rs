//! Each canonical scenario ends in its allow-set and never succeeds silently.

use crate::common::*;
use strata_exhaustion::{
    ErrorKind, KvBulkWrite, NearExhaustionUpdate, Scenario, ScenarioRunner, ScenarioStatus,
    SqlBulkMaterialize,
};
use tempfile::TempDir;

fn observed(report: &strata_exhaustion::RunReport, name: &str) -> ErrorKind {
    match &report.get(name).expect("scenario ran").status {
        ScenarioStatus::Passed { observed } => *observed,
        other => panic!("{} did not pass: {:?}", name, other),
    }
}

#[test]
fn test_kv_bulk_write_ends_in_out_of_memory_or_corruption() {
    let temp = TempDir::new().unwrap();
    let report = run_one(quick_config(&temp), KvBulkWrite);

    let kind = observed(&report, "kv_bulk_write");
    assert!(KvBulkWrite.allowed().contains(kind), "observed {}", kind);
    assert!(matches!(
        kind,
        ErrorKind::OutOfMemory | ErrorKind::CorruptedState
    ));
}

#[test]
fn test_sql_bulk_materialize_fails_and_namespace_recovers() {
    let temp = TempDir::new().unwrap();
    let report = run_one(quick_config(&temp), SqlBulkMaterialize);
    let kind = observed(&report, "sql_bulk_materialize");
    assert!(SqlBulkMaterialize.allowed().contains(kind));
}

#[test]
fn test_near_exhaustion_update_is_atomic() {
    let temp = TempDir::new().unwrap();
    let report = run_one(quick_config(&temp), NearExhaustionUpdate);
    let kind = observed(&report, "near_exhaustion_update");
    assert!(matches!(
        kind,
        ErrorKind::OutOfMemory | ErrorKind::GenericFailure
    ));
}

#[test]
fn test_canonical_run_passes_in_order() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let runner = ScenarioRunner::canonical(canonical_config(&temp)).unwrap();
    let report = runner.run();

    let names: Vec<_> = report.scenarios.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(
        names,
        ["kv_bulk_write", "sql_bulk_materialize", "near_exhaustion_update"]
    );
    assert!(report.is_success(), "{}", report.to_json().unwrap());
}

#[test]
fn test_pressure_too_weak_is_reported_as_unexpected_success() {
    // With no pressure and a roomy heap the update has nothing to fail on.
    let temp = TempDir::new().unwrap();
    let mut config = quick_config(&temp);
    config.near_exhaustion_update.heap_ceiling_mib = 256;
    config.near_exhaustion_update.pressure_fraction = 0.0;
    let report = run_one(config, NearExhaustionUpdate);

    match &report.scenarios[0].status {
        ScenarioStatus::Failed { reason } => {
            assert!(reason.contains("update under pressure"), "{}", reason);
            assert!(reason.contains("without the expected failure"), "{}", reason);
        }
        other => panic!("unexpected status: {:?}", other),
    }
    assert!(!report.aborted);
}
