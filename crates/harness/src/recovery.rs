//! Recovery protocol
//!
//! Rust frees memory deterministically, so "waiting for the collector" becomes
//! an explicit, bounded loop: each cycle asks every reclaimer to hand memory
//! back to the system, then pauses briefly. The cycle count and pause are
//! fixed by configuration; recovery never waits longer than
//! `cycles * pause` plus the reclaimers' own time.

use crate::config::RecoveryConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::Reclaimer;
use strata_storage::SqliteHeap;
use tracing::debug;

/// Returns freed heap pages to the OS on glibc targets
#[derive(Debug, Clone, Copy, Default)]
pub struct MallocTrim;

impl Reclaimer for MallocTrim {
    fn name(&self) -> &'static str {
        "malloc_trim"
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn reclaim(&self) -> u64 {
        // SAFETY: malloc_trim only walks allocator arenas; no preconditions.
        unsafe {
            libc::malloc_trim(0);
        }
        // glibc does not report how much it returned
        0
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn reclaim(&self) -> u64 {
        0
    }
}

/// What one recovery did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Cycles completed
    pub cycles: u32,
    /// Bytes the reclaimers reported freeing
    pub reclaimed_bytes: u64,
    /// Wall-clock time spent
    pub elapsed: Duration,
}

/// Bounded reclamation wait
#[derive(Clone)]
pub struct Recovery {
    cycles: u32,
    pause: Duration,
    reclaimers: Vec<Arc<dyn Reclaimer>>,
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recovery")
            .field("cycles", &self.cycles)
            .field("pause", &self.pause)
            .field(
                "reclaimers",
                &self.reclaimers.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Recovery {
    /// Recovery with the SQLite and allocator reclaimers
    pub fn new(config: &RecoveryConfig) -> Self {
        Self::without_reclaimers(config)
            .with_reclaimer(Arc::new(SqliteHeap))
            .with_reclaimer(Arc::new(MallocTrim))
    }

    /// Recovery that only pauses
    pub fn without_reclaimers(config: &RecoveryConfig) -> Self {
        Recovery {
            cycles: config.cycles,
            pause: config.pause(),
            reclaimers: Vec::new(),
        }
    }

    /// Add a reclaimer, run in registration order each cycle
    pub fn with_reclaimer(mut self, reclaimer: Arc<dyn Reclaimer>) -> Self {
        self.reclaimers.push(reclaimer);
        self
    }

    /// Configured cycle count
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Run every cycle
    pub fn recover(&self) -> RecoveryReport {
        let start = Instant::now();
        let mut reclaimed_bytes = 0u64;
        for _ in 0..self.cycles {
            for reclaimer in &self.reclaimers {
                reclaimed_bytes = reclaimed_bytes.saturating_add(reclaimer.reclaim());
            }
            std::thread::sleep(self.pause);
        }
        let report = RecoveryReport {
            cycles: self.cycles,
            reclaimed_bytes,
            elapsed: start.elapsed(),
        };
        debug!(
            target: "strata::oom::recovery",
            cycles = report.cycles,
            reclaimed_bytes = report.reclaimed_bytes,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Recovery complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting(AtomicU32);

    impl Reclaimer for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn reclaim(&self) -> u64 {
            self.0.fetch_add(1, Ordering::SeqCst);
            10
        }
    }

    #[test]
    fn test_recover_runs_every_reclaimer_each_cycle() {
        let counting = Arc::new(Counting(AtomicU32::new(0)));
        let config = RecoveryConfig {
            cycles: 3,
            pause_ms: 1,
        };
        let recovery = Recovery::without_reclaimers(&config).with_reclaimer(counting.clone());

        let report = recovery.recover();
        assert_eq!(report.cycles, 3);
        assert_eq!(report.reclaimed_bytes, 30);
        assert_eq!(counting.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_recover_is_bounded_by_pauses() {
        let config = RecoveryConfig {
            cycles: 5,
            pause_ms: 20,
        };
        let report = Recovery::new(&config).recover();
        assert!(report.elapsed >= Duration::from_millis(100));
        assert!(report.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_debug_lists_reclaimers() {
        let recovery = Recovery::new(&RecoveryConfig::default());
        let debug = format!("{:?}", recovery);
        assert!(debug.contains("sqlite"));
        assert!(debug.contains("malloc_trim"));
    }
}
