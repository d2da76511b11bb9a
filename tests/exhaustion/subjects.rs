//! Subject behavior the scenarios depend on, exercised without pressure.

use crate::common::*;
use std::sync::Arc;
use std::time::Duration;
use strata_exhaustion::strata_core::{exclusive, HeapGauge, MIB};
use strata_exhaustion::strata_storage::{
    BackingStore, KvStore, MemFs, MemFsLocation, MemoryNamespace, SqlLocation, SqlOptions,
    SqlSession, SqliteErrorCode,
};
use tempfile::TempDir;

fn idle_store(location: &MemFsLocation, heap: &Arc<HeapGauge>) -> KvStore {
    KvStore::builder(location.clone())
        .autocommit_delay(Duration::from_secs(3600))
        .open(heap)
        .unwrap()
}

#[test]
fn test_kv_committed_survives_unclean_shutdown() {
    let heap = HeapGauge::with_ceiling_mib(64);
    let location = MemFsLocation::new(unique("kv-unclean"));

    {
        let mut store = idle_store(&location, &heap);
        let map = store.open_map("records").unwrap();
        map.put(1, b"committed").unwrap();
        store.commit().unwrap();
        map.put(2, b"staged only").unwrap();
        drop(map);
        store.close_immediately();
    }

    let mut store = idle_store(&location, &heap);
    let map = store.open_map("records").unwrap();
    assert_eq!(map.get(1).unwrap().as_deref(), Some(&b"committed"[..]));
    assert_eq!(map.get(2).unwrap(), None);
    drop(map);
    store.close().unwrap();

    location.delete().unwrap();
    assert!(!MemFs::exists(location.name()));
}

#[test]
fn test_kv_clean_close_commits_staged_writes() {
    let heap = HeapGauge::with_ceiling_mib(64);
    let location = MemFsLocation::new(unique("kv-clean"));

    {
        let mut store = idle_store(&location, &heap);
        let map = store.open_map("records").unwrap();
        map.put(7, &[3u8; 1024]).unwrap();
        assert!(store.pending_bytes() >= 1024);
        drop(map);
        store.close().unwrap();
    }

    let store = idle_store(&location, &heap);
    let map = store.open_map("records").unwrap();
    assert_eq!(map.get(7).unwrap(), Some(vec![3u8; 1024]));
    drop(map);
    drop(store);
    location.delete().unwrap();
}

#[test]
fn test_sql_failed_statement_rolls_back() {
    let _session = exclusive();
    let temp = TempDir::new().unwrap();
    let heap = HeapGauge::new(64 * MIB);
    let location = SqlLocation::file(temp.path().join("atomic.db"));
    let options = SqlOptions::new().wal(true);

    let mut db = SqlSession::open(location.clone(), &options, &heap).unwrap();
    db.execute_batch(
        "CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT NOT NULL);
         INSERT INTO t VALUES (1, 'a'), (2, 'b'), (3, 'c');",
    )
    .unwrap();

    // The third row violates NOT NULL, so the whole statement is undone
    let err = db
        .execute("UPDATE t SET v = CASE id WHEN 3 THEN NULL ELSE v || v END")
        .unwrap_err();
    assert_eq!(err.code(), Some(SqliteErrorCode::ConstraintViolation));
    assert_eq!(
        db.query_row_i64("SELECT sum(length(v)) FROM t").unwrap(),
        3
    );
    db.close().unwrap();

    let mut db = SqlSession::open(location.clone(), &options, &heap).unwrap();
    assert_eq!(db.query_row_i64("SELECT count(*) FROM t").unwrap(), 3);
    db.close().unwrap();

    location.delete().unwrap();
    assert!(leftovers(temp.path()).is_empty());
}

#[test]
fn test_sql_memory_namespace_keeps_data_across_sessions() {
    let _session = exclusive();
    let heap = HeapGauge::new(64 * MIB);
    let namespace = MemoryNamespace::create(unique("mem"), &heap).unwrap();
    let location = namespace.location().clone();

    let mut db = SqlSession::open(location.clone(), &SqlOptions::new(), &heap).unwrap();
    db.execute_batch("CREATE TABLE keep(x); INSERT INTO keep VALUES (42);")
        .unwrap();
    db.close().unwrap();

    let mut db = SqlSession::open(location.clone(), &SqlOptions::new(), &heap).unwrap();
    assert_eq!(db.query_row_i64("SELECT x FROM keep").unwrap(), 42);
    db.close().unwrap();

    // Releasing the namespace discards it with the keeper connection
    namespace.delete().unwrap();
    let mut db = SqlSession::open(location, &SqlOptions::new(), &heap).unwrap();
    assert_eq!(
        db.query_row_i64("SELECT count(*) FROM sqlite_master").unwrap(),
        0
    );
    db.close().unwrap();
}
