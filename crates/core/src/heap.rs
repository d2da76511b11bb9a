//! Heap gauge: the harness's model of "the process heap"
//!
//! Rust has no managed heap with a configured maximum, and an allocation
//! failure inside safe code aborts the process. The gauge makes the maximum
//! explicit: a ceiling in bytes, against which everything the harness
//! allocates on purpose is charged.
//!
//! - [`HeapGauge::allocate`] charges first and reserves second, so a request
//!   past the ceiling (or one the allocator refuses) becomes an
//!   [`Exhaustion`] value instead of an abort.
//! - [`HeapBlock`] discharges on drop.
//! - Allocators the harness does not own (SQLite's, for example) are observed
//!   through registered [`HeapProbe`]s and count toward [`HeapGauge::occupancy`].
//!
//! Process-wide allocator settings are shared by every gauge, so anything that
//! changes them holds the [`exclusive`] heap session lock for its duration.

use crate::error::{Exhaustion, Result};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bytes in one mebibyte
pub const MIB: u64 = 1024 * 1024;

/// An allocator outside the gauge whose usage counts toward occupancy
pub trait HeapProbe: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Bytes currently held by this allocator
    fn bytes_in_use(&self) -> u64;
}

/// Something that can hand memory back to the system on request
///
/// Called by the recovery protocol between pauses.
pub trait Reclaimer: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Release whatever can be released; returns bytes freed if known
    fn reclaim(&self) -> u64;
}

// =============================================================================
// Heap session lock
// =============================================================================

static HEAP_SESSION: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Guard proving exclusive use of process-wide allocator limits
pub struct HeapSession {
    _guard: MutexGuard<'static, ()>,
}

impl fmt::Debug for HeapSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapSession").finish()
    }
}

/// Acquire the process-wide heap session lock
///
/// Blocks until no other session is active. Uses parking_lot, so a panic
/// in a previous holder does not poison the lock.
pub fn exclusive() -> HeapSession {
    HeapSession {
        _guard: HEAP_SESSION.lock(),
    }
}

// =============================================================================
// HeapGauge
// =============================================================================

/// Ceiling-bounded accounting of deliberate heap usage
pub struct HeapGauge {
    ceiling: u64,
    charged: AtomicU64,
    probes: RwLock<Vec<Arc<dyn HeapProbe>>>,
}

impl fmt::Debug for HeapGauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapGauge")
            .field("ceiling", &self.ceiling)
            .field("charged", &self.charged())
            .field("probes", &self.probes.read().len())
            .finish()
    }
}

impl HeapGauge {
    /// Create a gauge with the given ceiling in bytes
    pub fn new(ceiling: u64) -> Arc<Self> {
        Arc::new(HeapGauge {
            ceiling,
            charged: AtomicU64::new(0),
            probes: RwLock::new(Vec::new()),
        })
    }

    /// Create a gauge with a ceiling given in mebibytes
    pub fn with_ceiling_mib(mib: u64) -> Arc<Self> {
        Self::new(mib.saturating_mul(MIB))
    }

    /// Configured ceiling in bytes
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Bytes currently charged to the gauge
    pub fn charged(&self) -> u64 {
        self.charged.load(Ordering::Acquire)
    }

    /// Ceiling minus charged bytes
    ///
    /// Probed allocators enforce their own share against this value.
    pub fn headroom(&self) -> u64 {
        self.ceiling.saturating_sub(self.charged())
    }

    /// Estimated occupancy: charged bytes plus every probe
    pub fn occupancy(&self) -> u64 {
        let probed: u64 = self
            .probes
            .read()
            .iter()
            .map(|p| p.bytes_in_use())
            .fold(0u64, u64::saturating_add);
        self.charged().saturating_add(probed)
    }

    /// Occupancy as a fraction of the ceiling
    pub fn fraction(&self) -> f64 {
        if self.ceiling == 0 {
            return 1.0;
        }
        self.occupancy() as f64 / self.ceiling as f64
    }

    /// Count an external allocator toward occupancy
    pub fn register_probe(&self, probe: Arc<dyn HeapProbe>) {
        self.probes.write().push(probe);
    }

    /// Charge `bytes` against the ceiling
    ///
    /// Never lets `charged` exceed the ceiling, even under concurrent callers.
    pub fn try_charge(&self, bytes: u64) -> Result<()> {
        let mut current = self.charged.load(Ordering::Acquire);
        loop {
            let available = self.ceiling.saturating_sub(current);
            if bytes > available {
                return Err(Exhaustion::Ceiling {
                    requested: bytes,
                    available,
                    ceiling: self.ceiling,
                });
            }
            match self.charged.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Return previously charged bytes
    pub fn discharge(&self, bytes: u64) {
        let mut current = self.charged.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.charged.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Allocate a zero-filled block of `len` bytes charged to this gauge
    pub fn allocate(self: &Arc<Self>, len: usize) -> Result<HeapBlock> {
        let requested = len as u64;
        self.try_charge(requested)?;
        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            self.discharge(requested);
            return Err(Exhaustion::Allocator { requested });
        }
        data.resize(len, 0);
        Ok(HeapBlock {
            data,
            charged: requested,
            gauge: Arc::clone(self),
        })
    }

    /// Copy `bytes` into a new charged block
    pub fn allocate_copy(self: &Arc<Self>, bytes: &[u8]) -> Result<HeapBlock> {
        let mut block = self.allocate(bytes.len())?;
        block.copy_from_slice(bytes);
        Ok(block)
    }
}

// =============================================================================
// HeapBlock
// =============================================================================

/// Opaque bytes charged to a [`HeapGauge`]; discharged on drop
pub struct HeapBlock {
    data: Vec<u8>,
    charged: u64,
    gauge: Arc<HeapGauge>,
}

impl HeapBlock {
    /// Length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for HeapBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for HeapBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBlock").field("len", &self.len()).finish()
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        self.gauge.discharge(self.charged);
    }
}
