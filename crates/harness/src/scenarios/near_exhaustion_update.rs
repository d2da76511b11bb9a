//! Incremental update near exhaustion
//!
//! A file-backed table is grown once to establish a checkpointed baseline.
//! The same growth update then runs with most of the heap already taken. It
//! has to fail, and after a reopen the table must look exactly like the
//! baseline: same row count, same total text length, no half-applied growth.

use super::{series, spaces};
use crate::config::{HarnessConfig, NearExhaustionUpdateConfig};
use crate::oracle::{assert_post_condition, expect_failure, require, tolerate};
use crate::scenario::{HandleGuard, Scenario, ScenarioContext, ScenarioError};
use strata_core::{AllowSet, ErrorKind, MIB};
use strata_storage::{SqlLocation, SqlOptions, SqlSession};
use tracing::{debug, info};

const ALLOWED: AllowSet = AllowSet::of(&[ErrorKind::OutOfMemory, ErrorKind::GenericFailure]);

const CLOSE_ALLOWED: AllowSet = AllowSet::of(&[ErrorKind::EngineClosed]);

const DB_FILE: &str = "near_exhaustion_update.db";

const SHAPE: &str = "SELECT count(*), coalesce(sum(length(text)), 0) FROM stuff";

/// Incremental update under heap pressure
#[derive(Debug, Clone, Copy, Default)]
pub struct NearExhaustionUpdate;

fn populate_sql(cfg: &NearExhaustionUpdateConfig) -> String {
    format!(
        "CREATE TABLE stuff(id INTEGER PRIMARY KEY, text TEXT NOT NULL);
         {} INSERT INTO stuff(id, text) SELECT x, {} || x FROM r;",
        series(cfg.rows),
        spaces(cfg.base_chars)
    )
}

fn growth_sql(cfg: &NearExhaustionUpdateConfig) -> String {
    format!(
        "UPDATE stuff SET text = text || {} || id",
        spaces(cfg.growth_chars)
    )
}

fn options(cfg: &NearExhaustionUpdateConfig) -> SqlOptions {
    SqlOptions::new()
        .wal(true)
        .operation_memory_kib(cfg.operation_memory_kib)
}

fn shape(db: &SqlSession) -> Result<(i64, i64), strata_storage::SqlError> {
    db.query_row(SHAPE, |row| Ok((row.get(0)?, row.get(1)?)))
}

impl Scenario for NearExhaustionUpdate {
    fn name(&self) -> &'static str {
        "near_exhaustion_update"
    }

    fn allowed(&self) -> AllowSet {
        ALLOWED
    }

    fn heap_ceiling(&self, config: &HarnessConfig) -> u64 {
        config.near_exhaustion_update.heap_ceiling_mib.saturating_mul(MIB)
    }

    fn run(&self, ctx: &mut ScenarioContext<'_>) -> Result<ErrorKind, ScenarioError> {
        let name = self.name();
        let cfg = &ctx.config().near_exhaustion_update;
        let dir = ctx.fresh_dir()?;
        let location = SqlLocation::file(dir.join(DB_FILE));
        let options = options(cfg);
        let growth = growth_sql(cfg);

        let opened = SqlSession::open(location.clone(), &options, ctx.heap());
        let mut db = HandleGuard::new(require(name, "open", opened)?);
        require(name, "populate", db.execute_batch(&populate_sql(cfg)))?;
        require(name, "baseline update", db.execute(&growth))?;
        require(name, "checkpoint", db.checkpoint())?;
        let (rows, text_len) = require(name, "baseline shape", shape(&db))?;
        debug!(
            target: "strata::oom::scenario",
            scenario = name,
            rows,
            text_len,
            heap = %ctx.heap_summary(),
            "Baseline recorded"
        );

        let mut budget = ctx.pressure()?;
        let consumed = budget
            .consume(cfg.pressure_fraction)
            .map_err(|source| ScenarioError::Pressure {
                scenario: name.to_string(),
                source,
            })?;
        debug!(
            target: "strata::oom::scenario",
            scenario = name,
            occupancy = consumed.occupancy,
            target = consumed.target_bytes,
            "Heap under pressure"
        );
        let judged = expect_failure(name, "update under pressure", db.execute(&growth), ALLOWED);
        budget.release();
        let kind = judged?;
        ctx.recover();

        tolerate(name, "close", db.close(), CLOSE_ALLOWED)?;
        db.dispose();
        drop(db);

        let reopened = SqlSession::open(location, &options, ctx.heap());
        let mut db = HandleGuard::new(require(name, "reopen", reopened)?);
        let (rows_after, text_len_after) = require(name, "read back", shape(&db))?;
        assert_post_condition(name, "row count", rows_after, i64::from(cfg.rows))?;
        assert_post_condition(name, "total text length", text_len_after, text_len)?;
        require(name, "close reopened session", db.close())?;

        info!(
            target: "strata::oom::scenario",
            scenario = name,
            rows = rows_after,
            text_len = text_len_after,
            "Table unchanged by the failed update"
        );
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{exclusive, HeapGauge};
    use strata_storage::SqliteHeap;
    use tempfile::TempDir;

    fn small() -> NearExhaustionUpdateConfig {
        NearExhaustionUpdateConfig {
            rows: 50,
            ..NearExhaustionUpdateConfig::default()
        }
    }

    #[test]
    fn test_baseline_shape_without_pressure() {
        let _session = exclusive();
        let temp = TempDir::new().unwrap();
        let cfg = small();
        let heap = HeapGauge::new(64 * MIB);
        let db = SqlSession::open(
            SqlLocation::file(temp.path().join(DB_FILE)),
            &options(&cfg),
            &heap,
        )
        .unwrap();

        db.execute_batch(&populate_sql(&cfg)).unwrap();
        let digits: i64 = (1..=50i64).map(|id| id.to_string().len() as i64).sum();
        assert_eq!(shape(&db).unwrap(), (50, 50 * 100 + digits));

        assert_eq!(db.execute(&growth_sql(&cfg)).unwrap(), 50);
        assert_eq!(shape(&db).unwrap(), (50, 50 * 1100 + 2 * digits));
        drop(db);
        SqliteHeap::clear_hard_limit();
    }
}
