//! Scenario contract and the per-scenario environment
//!
//! A scenario is a named, statically defined sequence: setup, one operation
//! expected to fail under pressure, recovery, and post-recovery assertions.
//! It reports the [`ErrorKind`] it observed for the fault-inducing step, or a
//! [`ScenarioError`] explaining why it did not pass.
//!
//! Subject handles and backing stores are wrapped in guards so they are
//! disposed and deleted whether the scenario passes, fails or panics.

use crate::config::HarnessConfig;
use crate::pressure::{MemoryBudget, PressureError};
use crate::recovery::{Recovery, RecoveryReport};
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use strata_core::{AllowSet, ErrorKind, HeapGauge, MIB};
use strata_storage::{BackingStore, DirStore, SubjectHandle};
use thiserror::Error;
use tracing::warn;

/// Why a scenario did not pass
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// A step failed with a kind outside its allow-set
    #[error("{scenario}: {step} failed with {observed}, allowed {allowed}: {detail}")]
    Disallowed {
        /// Scenario name
        scenario: String,
        /// Step that failed
        step: String,
        /// Classified kind
        observed: ErrorKind,
        /// Kinds the step accepts
        allowed: AllowSet,
        /// Underlying error message
        detail: String,
    },

    /// A step that had to fail completed normally
    #[error("{scenario}: {step} completed without the expected failure")]
    UnexpectedSuccess {
        /// Scenario name
        scenario: String,
        /// Step that succeeded
        step: String,
    },

    /// A post-recovery check read back the wrong value
    #[error("{scenario}: {check}: expected {expected}, got {actual}")]
    PostCondition {
        /// Scenario name
        scenario: String,
        /// What was checked
        check: String,
        /// Expected value
        expected: String,
        /// Observed value
        actual: String,
    },

    /// A step that had to succeed failed
    #[error("{scenario}: {step} failed ({kind}): {detail}")]
    Step {
        /// Scenario name
        scenario: String,
        /// Step that failed
        step: String,
        /// Classified kind
        kind: ErrorKind,
        /// Underlying error message
        detail: String,
    },

    /// Raw exhaustion after recovery was assumed complete; aborts the run
    #[error("{scenario}: unrecovered exhaustion during {step}: {detail}")]
    Fatal {
        /// Scenario name
        scenario: String,
        /// Step that hit exhaustion
        step: String,
        /// Underlying error message
        detail: String,
    },

    /// The memory budget could not be used
    #[error("{scenario}: memory pressure: {source}")]
    Pressure {
        /// Scenario name
        scenario: String,
        /// Underlying pressure error
        #[source]
        source: PressureError,
    },

    /// The backing store could not be prepared
    #[error("{scenario}: {step}: {source}")]
    Io {
        /// Scenario name
        scenario: String,
        /// Step that failed
        step: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The scenario panicked
    #[error("{scenario}: panicked: {message}")]
    Panicked {
        /// Scenario name
        scenario: String,
        /// Panic payload, if it was a string
        message: String,
    },
}

impl ScenarioError {
    /// Whether the whole run must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScenarioError::Fatal { .. })
    }

    /// Name of the scenario the error belongs to
    pub fn scenario(&self) -> &str {
        match self {
            ScenarioError::Disallowed { scenario, .. }
            | ScenarioError::UnexpectedSuccess { scenario, .. }
            | ScenarioError::PostCondition { scenario, .. }
            | ScenarioError::Step { scenario, .. }
            | ScenarioError::Fatal { scenario, .. }
            | ScenarioError::Pressure { scenario, .. }
            | ScenarioError::Io { scenario, .. }
            | ScenarioError::Panicked { scenario, .. } => scenario,
        }
    }
}

/// A statically defined exhaustion scenario
pub trait Scenario: Send + Sync {
    /// Stable identifier
    fn name(&self) -> &'static str;

    /// Kinds accepted from the fault-inducing step
    fn allowed(&self) -> AllowSet;

    /// Heap ceiling this scenario runs against, in bytes
    fn heap_ceiling(&self, config: &HarnessConfig) -> u64;

    /// Run the scenario; returns the kind observed at the fault-inducing step
    fn run(&self, ctx: &mut ScenarioContext<'_>) -> Result<ErrorKind, ScenarioError>;
}

/// Everything a running scenario may touch
pub struct ScenarioContext<'a> {
    name: &'static str,
    config: &'a HarnessConfig,
    heap: Arc<HeapGauge>,
    recovery: &'a Recovery,
}

impl<'a> ScenarioContext<'a> {
    /// Context for scenario `name` against a fresh `heap`
    pub fn new(
        name: &'static str,
        config: &'a HarnessConfig,
        heap: Arc<HeapGauge>,
        recovery: &'a Recovery,
    ) -> Self {
        ScenarioContext {
            name,
            config,
            heap,
            recovery,
        }
    }

    /// Scenario name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Harness configuration
    pub fn config(&self) -> &'a HarnessConfig {
        self.config
    }

    /// The scenario's heap gauge
    pub fn heap(&self) -> &Arc<HeapGauge> {
        &self.heap
    }

    /// Run the recovery protocol
    pub fn recover(&self) -> RecoveryReport {
        self.recovery.recover()
    }

    /// Acquire the memory budget for the fault-inducing step
    pub fn pressure(&self) -> Result<MemoryBudget, ScenarioError> {
        MemoryBudget::acquire(&self.heap, &self.config.pressure, self.recovery.clone()).map_err(
            |source| ScenarioError::Pressure {
                scenario: self.name.to_string(),
                source,
            },
        )
    }

    /// Fresh, process-unique name for a backing store
    pub fn unique_name(&self) -> String {
        format!("{}-{}", self.name, uuid::Uuid::new_v4())
    }

    /// Fresh directory under `data_dir`, deleted when the guard drops
    pub fn fresh_dir(&self) -> Result<StoreGuard<DirStore>, ScenarioError> {
        let dir = DirStore::new(self.config.data_dir.join(self.unique_name()));
        dir.create().map_err(|source| ScenarioError::Io {
            scenario: self.name.to_string(),
            step: format!("create {}", dir.describe()),
            source,
        })?;
        Ok(StoreGuard::new(dir))
    }

    /// Heap state for logs
    pub fn heap_summary(&self) -> String {
        format!(
            "{:.1}/{} MiB",
            self.heap.occupancy() as f64 / MIB as f64,
            self.heap.ceiling() / MIB
        )
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Owns a subject handle; force-closes it on drop if still open
pub struct HandleGuard<H: SubjectHandle> {
    handle: H,
}

impl<H: SubjectHandle> HandleGuard<H> {
    /// Guard `handle`
    pub fn new(handle: H) -> Self {
        HandleGuard { handle }
    }

    /// Force-close now if the handle is still open
    pub fn dispose(&mut self) {
        if self.handle.is_open() {
            self.handle.force_close();
        }
    }
}

impl<H: SubjectHandle> Deref for HandleGuard<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H: SubjectHandle> DerefMut for HandleGuard<H> {
    fn deref_mut(&mut self) -> &mut H {
        &mut self.handle
    }
}

impl<H: SubjectHandle> Drop for HandleGuard<H> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Owns a backing store; deletes it recursively on drop
pub struct StoreGuard<S: BackingStore> {
    store: S,
}

impl<S: BackingStore> StoreGuard<S> {
    /// Guard `store`
    pub fn new(store: S) -> Self {
        StoreGuard { store }
    }
}

impl<S: BackingStore> Deref for StoreGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.store
    }
}

impl<S: BackingStore> Drop for StoreGuard<S> {
    fn drop(&mut self) {
        if let Err(e) = self.store.delete_recursive() {
            warn!(
                target: "strata::oom::store",
                store = %self.store.describe(),
                error = %e,
                "Failed to delete backing store"
            );
        }
    }
}
