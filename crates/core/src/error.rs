//! Error taxonomy for the exhaustion harness
//!
//! This module defines the discriminated outcome of a failed subject operation
//! ([`ErrorKind`]), the allow-sets scenarios declare over it ([`AllowSet`]), and
//! the raw exhaustion signal raised by the heap gauge ([`Exhaustion`]).
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for heap operations
pub type Result<T> = std::result::Result<T, Exhaustion>;

/// Classified outcome of a failed operation
///
/// Exactly one kind is produced per failed operation. A successful operation
/// is the absence of an `ErrorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The subject reported exhaustion, or a raw exhaustion signal was observed
    OutOfMemory,
    /// The subject reports persisted data is inconsistent or the store is unusable
    CorruptedState,
    /// The subject shut down and rejects further operations
    EngineClosed,
    /// Any other structured failure raised under pressure
    GenericFailure,
}

impl ErrorKind {
    /// All kinds, in declaration order
    pub const ALL: [ErrorKind; 4] = [
        ErrorKind::OutOfMemory,
        ErrorKind::CorruptedState,
        ErrorKind::EngineClosed,
        ErrorKind::GenericFailure,
    ];

    const fn bit(self) -> u8 {
        match self {
            ErrorKind::OutOfMemory => 1,
            ErrorKind::CorruptedState => 1 << 1,
            ErrorKind::EngineClosed => 1 << 2,
            ErrorKind::GenericFailure => 1 << 3,
        }
    }

    /// Stable snake_case name used in logs and reports
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::CorruptedState => "corrupted_state",
            ErrorKind::EngineClosed => "engine_closed",
            ErrorKind::GenericFailure => "generic_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of error kinds a scenario accepts as a terminal outcome
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AllowSet(u8);

impl AllowSet {
    /// The empty set: no failure is acceptable
    pub const NONE: AllowSet = AllowSet(0);

    /// Every kind is acceptable
    pub const ANY: AllowSet = AllowSet::of(&ErrorKind::ALL);

    /// Build a set from a list of kinds
    pub const fn of(kinds: &[ErrorKind]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < kinds.len() {
            bits |= kinds[i].bit();
            i += 1;
        }
        AllowSet(bits)
    }

    /// Whether `kind` is a member of this set
    pub const fn contains(self, kind: ErrorKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Whether the set is empty
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the members in declaration order
    pub fn iter(self) -> impl Iterator<Item = ErrorKind> {
        ErrorKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl fmt::Debug for AllowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for AllowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, kind) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", kind)?;
        }
        f.write_str("}")
    }
}

/// Raw exhaustion signal
///
/// Raised when an allocation would push the heap gauge past its ceiling, or
/// when the system allocator refuses a reservation outright.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Exhaustion {
    /// The gauge ceiling leaves no room for the request
    #[error("heap ceiling reached: requested {requested} bytes, {available} of {ceiling} available")]
    Ceiling {
        /// Bytes requested
        requested: u64,
        /// Bytes still available under the ceiling
        available: u64,
        /// Configured ceiling
        ceiling: u64,
    },

    /// The system allocator refused the reservation
    #[error("allocator refused {requested} bytes")]
    Allocator {
        /// Bytes requested
        requested: u64,
    },
}

impl Exhaustion {
    /// Bytes the failed request asked for
    pub fn requested(&self) -> u64 {
        match self {
            Exhaustion::Ceiling { requested, .. } | Exhaustion::Allocator { requested } => {
                *requested
            }
        }
    }
}

impl From<Exhaustion> for std::io::Error {
    fn from(e: Exhaustion) -> Self {
        std::io::Error::new(std::io::ErrorKind::OutOfMemory, e)
    }
}
