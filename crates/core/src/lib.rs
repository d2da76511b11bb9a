//! Core types for the Strata exhaustion harness
//!
//! This crate defines the foundational pieces every other crate builds on:
//! - ErrorKind / AllowSet: the failure taxonomy and the allow-sets scenarios declare
//! - Exhaustion: the raw exhaustion signal
//! - HeapGauge / HeapBlock: ceiling-bounded accounting of deliberate heap usage
//! - HeapProbe / Reclaimer: hooks for allocators the harness does not own
//! - FaultChannel: single-slot cell for failures raised on background threads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fault;
pub mod heap;

pub use error::{AllowSet, ErrorKind, Exhaustion, Result};
pub use fault::{FaultChannel, FaultReporter};
pub use heap::{exclusive, HeapBlock, HeapGauge, HeapProbe, HeapSession, Reclaimer, MIB};
