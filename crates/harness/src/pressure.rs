//! Memory pressure controller
//!
//! A [`MemoryBudget`] steers heap occupancy toward a target fraction of the
//! gauge ceiling by holding opaque blocks, and gives all of them back at once.
//! Only one budget may be alive in the process at a time: two budgets would
//! fight over the same ceiling and neither target would mean anything.

use crate::config::PressureConfig;
use crate::recovery::{Recovery, RecoveryReport};
use rand::RngCore;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_core::{Exhaustion, HeapBlock, HeapGauge};
use thiserror::Error;
use tracing::debug;

/// Set while a budget is alive
static BUDGET_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Errors raised by the pressure controller
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PressureError {
    /// Another budget is still alive
    #[error("a memory budget is already active")]
    AlreadyActive,

    /// The target fraction is outside 0..=1
    #[error("target fraction {0} is outside 0..=1")]
    InvalidFraction(f64),
}

/// What one call to [`MemoryBudget::consume`] achieved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumeReport {
    /// Occupancy the call aimed for, in bytes
    pub target_bytes: u64,
    /// Occupancy when the call returned, in bytes
    pub occupancy: u64,
    /// Blocks held by the budget in total
    pub blocks_held: usize,
    /// Bytes held by the budget in total
    pub bytes_held: u64,
    /// Exhaustion that stopped consumption early, if any
    #[serde(skip)]
    pub stopped_by: Option<Exhaustion>,
}

impl ConsumeReport {
    /// Whether occupancy reached the target
    pub fn reached_target(&self) -> bool {
        self.occupancy >= self.target_bytes
    }
}

/// Opaque blocks held against a heap gauge
///
/// Released with [`MemoryBudget::release`]; dropping the budget also drops
/// every block but skips the recovery wait.
pub struct MemoryBudget {
    heap: Arc<HeapGauge>,
    recovery: Recovery,
    block_bytes: usize,
    blocks: Vec<HeapBlock>,
}

impl std::fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("block_bytes", &self.block_bytes)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl MemoryBudget {
    /// Take the process-wide budget slot
    pub fn acquire(
        heap: &Arc<HeapGauge>,
        config: &PressureConfig,
        recovery: Recovery,
    ) -> Result<Self, PressureError> {
        if BUDGET_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PressureError::AlreadyActive);
        }
        Ok(MemoryBudget {
            heap: Arc::clone(heap),
            recovery,
            block_bytes: config.block_bytes.max(1),
            blocks: Vec::new(),
        })
    }

    /// Whether some budget is currently alive
    pub fn is_active() -> bool {
        BUDGET_ACTIVE.load(Ordering::Acquire)
    }

    /// Bytes held by this budget
    pub fn bytes_held(&self) -> u64 {
        self.blocks.iter().map(|b| b.len() as u64).sum()
    }

    /// Blocks held by this budget
    pub fn blocks_held(&self) -> usize {
        self.blocks.len()
    }

    /// Allocate blocks until occupancy reaches `fraction` of the ceiling
    ///
    /// An allocation failure ends consumption early without failing the call;
    /// the blocks already taken stay held.
    pub fn consume(&mut self, fraction: f64) -> Result<ConsumeReport, PressureError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(PressureError::InvalidFraction(fraction));
        }
        let target_bytes = (self.heap.ceiling() as f64 * fraction) as u64;
        let mut rng = rand::thread_rng();
        let mut stopped_by = None;

        while self.heap.occupancy() < target_bytes {
            match self.heap.allocate(self.block_bytes) {
                Ok(mut block) => {
                    // Touch every page so the block is really resident
                    rng.fill_bytes(&mut block);
                    self.blocks.push(block);
                }
                Err(e) => {
                    stopped_by = Some(e);
                    break;
                }
            }
        }

        let report = ConsumeReport {
            target_bytes,
            occupancy: self.heap.occupancy(),
            blocks_held: self.blocks.len(),
            bytes_held: self.bytes_held(),
            stopped_by,
        };
        debug!(
            target: "strata::oom::pressure",
            fraction,
            target_bytes = report.target_bytes,
            occupancy = report.occupancy,
            blocks = report.blocks_held,
            stopped_early = report.stopped_by.is_some(),
            "Consumed heap"
        );
        Ok(report)
    }

    /// Drop every held block, then wait for recovery
    pub fn release(mut self) -> RecoveryReport {
        let released = self.bytes_held();
        self.blocks.clear();
        debug!(target: "strata::oom::pressure", released, "Released memory budget");
        self.recovery.recover()
    }
}

impl Drop for MemoryBudget {
    fn drop(&mut self) {
        self.blocks.clear();
        BUDGET_ACTIVE.store(false, Ordering::Release);
    }
}
