//! Integration tests for the exhaustion harness.
//!
//! These drive the real subjects (redb over the in-memory filesystem, SQLite
//! through rusqlite) to exhaustion through the public runner and check the
//! end-to-end guarantees: every scenario ends in its allow-set, data survives
//! unclean shutdowns, failed updates leave no trace, and nothing leaks from
//! one scenario into the next.
//!
//! Unit tests in crates/*/src cover classification, accounting and config in
//! isolation.

#[path = "../common/mod.rs"]
mod common;

mod isolation;
mod recovery;
mod scenarios;
mod subjects;
