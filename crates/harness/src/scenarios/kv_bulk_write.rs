//! Bulk-write exhaustion on the raw key-value store
//!
//! Large randomized records go into a write-behind store over the in-memory
//! filesystem until either an insert fails or the background writer reports a
//! fault. The store is then torn down without a clean close and reopened from
//! the same namespace: whatever was committed must read back intact.

use crate::config::HarnessConfig;
use crate::oracle::{assert_post_condition, expect_failure, judge, require, tolerate, Failure};
use crate::scenario::{HandleGuard, Scenario, ScenarioContext, ScenarioError, StoreGuard};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{AllowSet, ErrorKind, FaultChannel, HeapGauge, MIB};
use strata_storage::{KvError, KvMap, KvStore, MemFsLocation};
use tracing::{debug, info};

const MAP: &str = "test";

const ALLOWED: AllowSet = AllowSet::of(&[ErrorKind::OutOfMemory, ErrorKind::CorruptedState]);

/// Bulk-write exhaustion on the key-value store
#[derive(Debug, Clone, Copy, Default)]
pub struct KvBulkWrite;

fn fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

/// Generate one record on the gauge and stage it; returns its fingerprint
fn insert(
    heap: &Arc<HeapGauge>,
    map: &KvMap<'_>,
    key: u64,
    len: usize,
    rng: &mut StdRng,
) -> Result<u64, Failure> {
    let mut payload = heap.allocate(len)?;
    rng.fill_bytes(&mut payload);
    let print = fingerprint(&payload);
    map.put(key, &payload)?;
    Ok(print)
}

/// Check the reopened map against the accepted fingerprints
///
/// The first `committed` keys must be present and intact. Later keys were
/// only staged and may be missing, but anything present must match.
fn verify_durable(
    name: &str,
    map: &KvMap<'_>,
    accepted: &[u64],
    committed: u64,
) -> Result<usize, ScenarioError> {
    let mut durable = 0usize;
    for (key, expected) in (0u64..).zip(accepted) {
        let value = require(name, "read back", map.get(key))?;
        if key < committed {
            assert_post_condition(
                name,
                &format!("committed record {} present", key),
                value.is_some(),
                true,
            )?;
        }
        if let Some(value) = value {
            assert_post_condition(
                name,
                &format!("record {} content", key),
                fingerprint(&value),
                *expected,
            )?;
            durable += 1;
        }
    }
    Ok(durable)
}

impl Scenario for KvBulkWrite {
    fn name(&self) -> &'static str {
        "kv_bulk_write"
    }

    fn allowed(&self) -> AllowSet {
        ALLOWED
    }

    fn heap_ceiling(&self, config: &HarnessConfig) -> u64 {
        config.kv_bulk_write.heap_ceiling_mib.saturating_mul(MIB)
    }

    fn run(&self, ctx: &mut ScenarioContext<'_>) -> Result<ErrorKind, ScenarioError> {
        let name = self.name();
        let cfg = &ctx.config().kv_bulk_write;
        let location = StoreGuard::new(MemFsLocation::new(ctx.unique_name()));

        let faults: FaultChannel<Failure> = FaultChannel::new();
        let reporter = faults.reporter();
        let opened = KvStore::builder((*location).clone())
            .background_fault_handler(move |e: KvError| {
                reporter.report(Failure::Kv(e));
            })
            .autocommit_bytes(cfg.autocommit_bytes)
            .autocommit_delay(Duration::from_millis(cfg.autocommit_delay_ms))
            .open(ctx.heap());
        let mut store = HandleGuard::new(require(name, "open store", opened)?);

        // Fingerprints of every record the store accepted, indexed by key
        let mut accepted = Vec::new();
        let foreground = {
            let map = require(name, "open map", store.open_map(MAP))?;
            let mut rng = StdRng::seed_from_u64(cfg.seed);
            let mut outcome = Ok(());
            for key in 0..u64::from(cfg.max_records) {
                match insert(ctx.heap(), &map, key, cfg.record_bytes, &mut rng) {
                    Ok(print) => accepted.push(print),
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
                if faults.is_faulted() {
                    break;
                }
            }
            outcome
        };
        debug!(
            target: "strata::oom::scenario",
            scenario = name,
            accepted = accepted.len(),
            heap = %ctx.heap_summary(),
            "Insert loop finished"
        );

        // A poisoned foreground error is the echo of a background fault; report
        // the fault itself when there is one.
        let kind = match (foreground, faults.poll()) {
            (Err(Failure::Kv(KvError::Poisoned(_))), Some(fault)) => {
                judge(name, "background commit", fault, ALLOWED)?
            }
            (Err(failure), _) => judge(name, "insert", &failure, ALLOWED)?,
            (Ok(()), Some(fault)) => judge(name, "background commit", fault, ALLOWED)?,
            (Ok(()), None) => expect_failure(name, "insert", Ok::<(), Failure>(()), ALLOWED)?,
        };

        ctx.recover();
        tolerate(name, "close", store.close(), AllowSet::ANY)?;
        store.close_immediately();
        let committed = store.committed_entries();
        drop(store);
        ctx.recover();

        let reopened = KvStore::builder((*location).clone()).open(ctx.heap());
        let mut reopened = HandleGuard::new(require(name, "reopen store", reopened)?);
        let durable = {
            let map = require(name, "reopen map", reopened.open_map(MAP))?;
            verify_durable(name, &map, &accepted, committed)?
        };
        require(name, "close reopened store", reopened.close())?;

        info!(
            target: "strata::oom::scenario",
            scenario = name,
            accepted = accepted.len(),
            committed,
            durable,
            "Reopened store reads back committed records"
        );
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_distinguishes_payloads() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut a = vec![0u8; 1024];
        let mut b = vec![0u8; 1024];
        rng.fill_bytes(&mut a);
        rng.fill_bytes(&mut b);
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    fn reopened_with(loc: &MemFsLocation, heap: &Arc<HeapGauge>, records: &[&[u8]]) -> KvStore {
        {
            let mut store = KvStore::builder(loc.clone()).open(heap).unwrap();
            let map = store.open_map(MAP).unwrap();
            for (key, record) in (0u64..).zip(records) {
                map.put(key, record).unwrap();
            }
            store.commit().unwrap();
            drop(map);
            store.close_immediately();
        }
        KvStore::builder(loc.clone()).open(heap).unwrap()
    }

    #[test]
    fn test_verify_durable_accepts_intact_prefix() {
        let heap = HeapGauge::new(64 * MIB);
        let loc = MemFsLocation::new(format!("kv-verify-ok-{}", uuid::Uuid::new_v4()));
        let store = reopened_with(&loc, &heap, &[b"zero".as_slice(), b"one".as_slice()]);
        let map = store.open_map(MAP).unwrap();

        // The third record was accepted but never committed
        let accepted = [fingerprint(b"zero"), fingerprint(b"one"), fingerprint(b"two")];
        assert_eq!(verify_durable("kv", &map, &accepted, 2).unwrap(), 2);
        drop(map);
        drop(store);
        strata_storage::MemFs::delete(loc.name());
    }

    #[test]
    fn test_verify_durable_rejects_missing_committed_record() {
        let heap = HeapGauge::new(64 * MIB);
        let loc = MemFsLocation::new(format!("kv-verify-lost-{}", uuid::Uuid::new_v4()));
        let store = reopened_with(&loc, &heap, &[b"zero".as_slice(), b"one".as_slice()]);
        let map = store.open_map(MAP).unwrap();

        let accepted = [fingerprint(b"zero"), fingerprint(b"one"), fingerprint(b"two")];
        let err = verify_durable("kv", &map, &accepted, 3).unwrap_err();
        match err {
            ScenarioError::PostCondition { check, .. } => {
                assert_eq!(check, "committed record 2 present")
            }
            other => panic!("unexpected error: {other}"),
        }
        drop(map);
        drop(store);
        strata_storage::MemFs::delete(loc.name());
    }

    #[test]
    fn test_verify_durable_rejects_changed_record() {
        let heap = HeapGauge::new(64 * MIB);
        let loc = MemFsLocation::new(format!("kv-verify-bad-{}", uuid::Uuid::new_v4()));
        let store = reopened_with(&loc, &heap, &[b"zero".as_slice(), b"uno".as_slice()]);
        let map = store.open_map(MAP).unwrap();

        let accepted = [fingerprint(b"zero"), fingerprint(b"one")];
        assert!(matches!(
            verify_durable("kv", &map, &accepted, 2),
            Err(ScenarioError::PostCondition { .. })
        ));
        drop(map);
        drop(store);
        strata_storage::MemFs::delete(loc.name());
    }

    #[test]
    fn test_allow_set() {
        let allowed = KvBulkWrite.allowed();
        assert!(allowed.contains(ErrorKind::OutOfMemory));
        assert!(allowed.contains(ErrorKind::CorruptedState));
        assert!(!allowed.contains(ErrorKind::EngineClosed));
        assert!(!allowed.contains(ErrorKind::GenericFailure));
    }
}
