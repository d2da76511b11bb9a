//! Bulk materialization through a single SQL statement
//!
//! One `CREATE TABLE ... AS` generates far more text than the heap can hold.
//! Any of the four kinds is an acceptable failure; what matters is that the
//! namespace is usable again afterwards and still holds what was committed
//! before the failure.

use super::{series, spaces};
use crate::config::{HarnessConfig, SqlBulkMaterializeConfig};
use crate::oracle::{assert_post_condition, expect_failure, require, tolerate};
use crate::scenario::{HandleGuard, Scenario, ScenarioContext, ScenarioError, StoreGuard};
use strata_core::{AllowSet, ErrorKind, MIB};
use strata_storage::{MemoryNamespace, SqlOptions, SqlSession};
use tracing::info;

const ALLOWED: AllowSet = AllowSet::ANY;

/// Rows committed before the failing statement
const BASELINE_ROWS: u32 = 100;

/// Bulk materialization via one query
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlBulkMaterialize;

fn materialize_sql(cfg: &SqlBulkMaterializeConfig) -> String {
    format!(
        "CREATE TABLE test AS {} SELECT x AS id, {} AS name FROM r",
        series(cfg.rows),
        spaces(format!("{} + x", cfg.row_chars))
    )
}

fn baseline_sql() -> String {
    format!(
        "CREATE TABLE baseline AS {} SELECT x AS id FROM r",
        series(BASELINE_ROWS)
    )
}

fn baseline_shape(db: &SqlSession) -> Result<(i64, i64), strata_storage::SqlError> {
    db.query_row("SELECT count(*), coalesce(sum(id), 0) FROM baseline", |row| {
        Ok((row.get(0)?, row.get(1)?))
    })
}

impl Scenario for SqlBulkMaterialize {
    fn name(&self) -> &'static str {
        "sql_bulk_materialize"
    }

    fn allowed(&self) -> AllowSet {
        ALLOWED
    }

    fn heap_ceiling(&self, config: &HarnessConfig) -> u64 {
        config.sql_bulk_materialize.heap_ceiling_mib.saturating_mul(MIB)
    }

    fn run(&self, ctx: &mut ScenarioContext<'_>) -> Result<ErrorKind, ScenarioError> {
        let name = self.name();
        let cfg = &ctx.config().sql_bulk_materialize;
        let namespace = StoreGuard::new(require(
            name,
            "create namespace",
            MemoryNamespace::create(ctx.unique_name(), ctx.heap()),
        )?);
        let options = SqlOptions::new();

        let opened = SqlSession::open(namespace.location().clone(), &options, ctx.heap());
        let mut db = HandleGuard::new(require(name, "open", opened)?);
        require(name, "baseline", db.execute(&baseline_sql()))?;
        let baseline = require(name, "baseline shape", baseline_shape(&db))?;

        let kind = expect_failure(name, "materialize", db.execute(&materialize_sql(cfg)), ALLOWED)?;
        ctx.recover();

        tolerate(name, "close", db.close(), ALLOWED)?;
        db.dispose();
        drop(db);
        ctx.recover();

        let reopened = SqlSession::open(namespace.location().clone(), &options, ctx.heap());
        let mut fresh = HandleGuard::new(require(name, "reconnect", reopened)?);
        let one = require(name, "SELECT 1", fresh.query_row_i64("SELECT 1"))?;
        assert_post_condition(name, "SELECT 1", one, 1)?;
        let after = require(name, "read baseline", baseline_shape(&fresh))?;
        assert_post_condition(name, "baseline rows", after, baseline)?;
        let leftover = require(
            name,
            "failed table absent",
            fresh.query_row_i64("SELECT count(*) FROM sqlite_master WHERE name = 'test'"),
        )?;
        assert_post_condition(name, "failed table absent", leftover, 0)?;
        require(name, "close fresh session", fresh.close())?;

        info!(
            target: "strata::oom::scenario",
            scenario = name,
            "Fresh session usable after failed materialization"
        );
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{exclusive, HeapGauge};
    use strata_storage::{BackingStore, SqliteHeap};

    #[test]
    fn test_materialize_sql_grows_per_row() {
        let _session = exclusive();
        let cfg = SqlBulkMaterializeConfig {
            heap_ceiling_mib: 64,
            rows: 4,
            row_chars: 10,
        };
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute(&materialize_sql(&cfg), []).unwrap();
        let lengths: Vec<i64> = conn
            .prepare("SELECT length(name) FROM test ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(lengths, vec![11, 12, 13, 14]);
    }

    #[test]
    fn test_baseline_readable_from_a_fresh_session() {
        let _session = exclusive();
        let heap = HeapGauge::new(64 * MIB);
        let ns = MemoryNamespace::create(
            format!("sql-bulk-baseline-{}", uuid::Uuid::new_v4()),
            &heap,
        )
        .unwrap();

        let mut db = SqlSession::open(ns.location().clone(), &SqlOptions::new(), &heap).unwrap();
        db.execute(&baseline_sql()).unwrap();
        let before = baseline_shape(&db).unwrap();
        db.close().unwrap();
        assert_eq!(before, (100, 5050));

        let mut db = SqlSession::open(ns.location().clone(), &SqlOptions::new(), &heap).unwrap();
        assert_eq!(baseline_shape(&db).unwrap(), before);
        db.close().unwrap();
        ns.delete().unwrap();
        SqliteHeap::clear_hard_limit();
    }
}
