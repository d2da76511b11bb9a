//! Strata exhaustion - out-of-memory fault injection for embedded storage
//!
//! Drives two embedded transactional engines (redb and SQLite) toward heap
//! exhaustion and checks that a failed operation never corrupts persisted
//! state or breaks atomicity, including across unclean shutdowns.
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_exhaustion::{HarnessConfig, ScenarioRunner};
//!
//! strata_exhaustion::logging::init();
//! let runner = ScenarioRunner::canonical(HarnessConfig::default())?;
//! let report = runner.run();
//! println!("{}", report.to_json()?);
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: heap gauge, fault channel, error kinds
//! - `strata-storage`: the key-value and SQL subjects
//! - `strata-harness`: pressure, recovery, oracle, scenarios and the runner
//!
//! The harness API is re-exported here; the lower crates are re-exported
//! whole.

pub use strata_harness::*;

pub use strata_core;
pub use strata_storage;
