//! The canonical scenarios, in run order

mod kv_bulk_write;
mod near_exhaustion_update;
mod sql_bulk_materialize;

pub use kv_bulk_write::KvBulkWrite;
pub use near_exhaustion_update::NearExhaustionUpdate;
pub use sql_bulk_materialize::SqlBulkMaterialize;

use crate::scenario::Scenario;

/// Every scenario, in the fixed order the runner executes them
pub fn canonical() -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(KvBulkWrite),
        Box::new(SqlBulkMaterialize),
        Box::new(NearExhaustionUpdate),
    ]
}

/// SQL expression producing `count` spaces; `count` may itself be SQL
pub(crate) fn spaces(count: impl std::fmt::Display) -> String {
    format!("replace(hex(zeroblob({})), '00', ' ')", count)
}

/// Recursive CTE yielding `x` from 1 to `rows`
pub(crate) fn series(rows: u32) -> String {
    format!(
        "WITH RECURSIVE r(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM r WHERE x < {})",
        rows
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::exclusive;

    #[test]
    fn test_canonical_order() {
        let names: Vec<_> = canonical().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            ["kv_bulk_write", "sql_bulk_materialize", "near_exhaustion_update"]
        );
    }

    #[test]
    fn test_spaces_expression_length() {
        let _session = exclusive();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let sql = format!("SELECT length({}), trim({}) = ''", spaces(17), spaces(17));
        let (len, blank): (i64, bool) = conn
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        assert_eq!(len, 17);
        assert!(blank);
    }

    #[test]
    fn test_series_counts_rows() {
        let _session = exclusive();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let sql = format!("{} SELECT count(*), sum(x) FROM r", series(10));
        let (count, sum): (i64, i64) = conn
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        assert_eq!((count, sum), (10, 55));
    }
}
