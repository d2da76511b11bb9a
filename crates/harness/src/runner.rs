//! Scenario runner
//!
//! Runs scenarios strictly in order while holding the process-wide heap
//! session. Each scenario starts from a recovered baseline with a fresh heap
//! gauge, runs behind `catch_unwind`, and is reported on its own. Only an
//! unrecovered exhaustion ([`ScenarioError::Fatal`]) stops the run early.

use crate::config::{ConfigError, HarnessConfig};
use crate::recovery::Recovery;
use crate::scenario::{Scenario, ScenarioContext, ScenarioError};
use crate::scenarios;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use strata_core::{exclusive, ErrorKind, HeapGauge};
use strata_storage::SqliteHeap;
use tracing::{error, info, warn};

/// Terminal status of one scenario
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScenarioStatus {
    /// The fault-inducing step failed with an allowed kind and every
    /// post-condition held
    Passed {
        /// Kind observed at the fault-inducing step
        observed: ErrorKind,
    },
    /// The scenario did not pass; the run continued
    Failed {
        /// Why
        reason: String,
    },
    /// The scenario hit unrecovered exhaustion; the run stopped
    Aborted {
        /// Why
        reason: String,
    },
}

/// Outcome of one scenario
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioReport {
    /// Scenario name
    pub name: String,
    /// Terminal status
    #[serde(flatten)]
    pub status: ScenarioStatus,
    /// Wall-clock time, in milliseconds
    pub duration_ms: u64,
}

impl ScenarioReport {
    /// Whether the scenario passed
    pub fn passed(&self) -> bool {
        matches!(self.status, ScenarioStatus::Passed { .. })
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Reports of the scenarios that ran, in order
    pub scenarios: Vec<ScenarioReport>,
    /// Whether a fatal error stopped the run early
    pub aborted: bool,
    /// Wall-clock time, in milliseconds
    pub duration_ms: u64,
}

impl RunReport {
    /// Whether every scenario ran and passed
    pub fn is_success(&self) -> bool {
        !self.aborted && self.scenarios.iter().all(ScenarioReport::passed)
    }

    /// Number of scenarios that passed
    pub fn passed(&self) -> usize {
        self.scenarios.iter().filter(|r| r.passed()).count()
    }

    /// Number of scenarios that did not pass
    pub fn failed(&self) -> usize {
        self.scenarios.len() - self.passed()
    }

    /// Report for `name`, if that scenario ran
    pub fn get(&self, name: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|r| r.name == name)
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs a fixed, ordered list of scenarios
pub struct ScenarioRunner {
    config: HarnessConfig,
    recovery: Recovery,
    scenarios: Vec<Box<dyn Scenario>>,
}

impl std::fmt::Debug for ScenarioRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioRunner")
            .field("scenarios", &self.names())
            .field("recovery", &self.recovery)
            .finish()
    }
}

impl ScenarioRunner {
    /// Runner over the canonical scenarios
    pub fn canonical(config: HarnessConfig) -> Result<Self, ConfigError> {
        Self::new(config, scenarios::canonical())
    }

    /// Runner over `scenarios`, in the given order
    pub fn new(config: HarnessConfig, scenarios: Vec<Box<dyn Scenario>>) -> Result<Self, ConfigError> {
        config.validate()?;
        let recovery = Recovery::new(&config.recovery);
        Ok(ScenarioRunner {
            config,
            recovery,
            scenarios,
        })
    }

    /// Scenario names in run order
    pub fn names(&self) -> Vec<&'static str> {
        self.scenarios.iter().map(|s| s.name()).collect()
    }

    /// Run every scenario in order
    pub fn run(&self) -> RunReport {
        let _session = exclusive();
        let start = Instant::now();
        let mut reports = Vec::with_capacity(self.scenarios.len());
        let mut aborted = false;

        for scenario in &self.scenarios {
            let report = self.run_scenario(scenario.as_ref());
            let fatal = matches!(report.status, ScenarioStatus::Aborted { .. });
            reports.push(report);
            if fatal {
                aborted = true;
                break;
            }
        }
        SqliteHeap::clear_hard_limit();

        let report = RunReport {
            scenarios: reports,
            aborted,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            target: "strata::oom::runner",
            passed = report.passed(),
            failed = report.failed(),
            aborted = report.aborted,
            duration_ms = report.duration_ms,
            "Run complete"
        );
        report
    }

    fn run_scenario(&self, scenario: &dyn Scenario) -> ScenarioReport {
        let name = scenario.name();
        self.recovery.recover();

        let heap = HeapGauge::new(scenario.heap_ceiling(&self.config));
        heap.register_probe(Arc::new(SqliteHeap));
        info!(
            target: "strata::oom::runner",
            scenario = name,
            ceiling = heap.ceiling(),
            allowed = %scenario.allowed(),
            "Starting scenario"
        );

        let start = Instant::now();
        let mut ctx = ScenarioContext::new(name, &self.config, heap, &self.recovery);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| scenario.run(&mut ctx)))
            .unwrap_or_else(|payload| {
                Err(ScenarioError::Panicked {
                    scenario: name.to_string(),
                    message: panic_message(payload.as_ref()),
                })
            });
        drop(ctx);
        SqliteHeap::clear_hard_limit();
        let duration_ms = start.elapsed().as_millis() as u64;

        let status = match outcome {
            Ok(observed) => {
                info!(
                    target: "strata::oom::runner",
                    scenario = name,
                    observed = %observed,
                    duration_ms,
                    "Scenario passed"
                );
                ScenarioStatus::Passed { observed }
            }
            Err(e) if e.is_fatal() => {
                error!(target: "strata::oom::runner", scenario = name, error = %e, "Scenario aborted the run");
                ScenarioStatus::Aborted {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                warn!(target: "strata::oom::runner", scenario = name, error = %e, "Scenario failed");
                ScenarioStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };
        ScenarioReport {
            name: name.to_string(),
            status,
            duration_ms,
        }
    }
}
