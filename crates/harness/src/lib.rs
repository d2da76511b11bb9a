//! Out-of-memory fault-injection harness
//!
//! Drives the storage subjects toward heap exhaustion and checks that they
//! stay atomic and durable while doing so:
//! - MemoryBudget: steers heap occupancy to a target fraction and back
//! - Recovery: bounded reclamation cycles between failures
//! - oracle: classifies failures against a scenario's allow-set
//! - ScenarioRunner: runs the canonical scenarios in order
//!
//! # Example
//!
//! ```ignore
//! use strata_harness::{HarnessConfig, ScenarioRunner};
//!
//! strata_harness::logging::init();
//! let runner = ScenarioRunner::canonical(HarnessConfig::default())?;
//! let report = runner.run();
//! assert!(report.is_success(), "{}", report.to_json()?);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod logging;
pub mod oracle;
pub mod pressure;
pub mod recovery;
pub mod runner;
pub mod scenario;
pub mod scenarios;

pub use config::{
    ConfigError, HarnessConfig, KvBulkWriteConfig, NearExhaustionUpdateConfig, PressureConfig,
    RecoveryConfig, SqlBulkMaterializeConfig, CONFIG_FILE_NAME,
};
pub use oracle::{
    assert_post_condition, classify, expect_failure, judge, require, tolerate, Failure,
};
pub use pressure::{ConsumeReport, MemoryBudget, PressureError};
pub use recovery::{MallocTrim, Recovery, RecoveryReport};
pub use runner::{RunReport, ScenarioReport, ScenarioRunner, ScenarioStatus};
pub use scenario::{HandleGuard, Scenario, ScenarioContext, ScenarioError, StoreGuard};
pub use scenarios::{canonical, KvBulkWrite, NearExhaustionUpdate, SqlBulkMaterialize};

pub use strata_core::{AllowSet, ErrorKind};
