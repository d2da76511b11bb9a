//! Outcome oracle
//!
//! Every failure a subject can raise is folded into one [`Failure`] value and
//! classified into exactly one [`ErrorKind`]. Scenarios never look at engine
//! errors directly: they declare an allow-set and hand the outcome to one of
//! the checks below.

use crate::scenario::ScenarioError;
use std::fmt;
use strata_core::{AllowSet, ErrorKind, Exhaustion};
use strata_storage::{KvError, SqlError, SqliteErrorCode};
use tracing::{info, warn};

/// Anything a subject operation can raise
#[derive(Debug)]
pub enum Failure {
    /// Raw exhaustion from the heap gauge
    Exhaustion(Exhaustion),
    /// Key-value store error
    Kv(KvError),
    /// SQL session error
    Sql(SqlError),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Exhaustion(e) => write!(f, "{}", e),
            Failure::Kv(e) => write!(f, "{}", e),
            Failure::Sql(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Failure {}

impl From<Exhaustion> for Failure {
    fn from(e: Exhaustion) -> Self {
        Failure::Exhaustion(e)
    }
}

impl From<KvError> for Failure {
    fn from(e: KvError) -> Self {
        Failure::Kv(e)
    }
}

impl From<SqlError> for Failure {
    fn from(e: SqlError) -> Self {
        Failure::Sql(e)
    }
}

impl Failure {
    /// Whether this is the raw exhaustion signal rather than an engine error
    pub fn is_raw_exhaustion(&self) -> bool {
        matches!(self, Failure::Exhaustion(_))
    }
}

/// Map a failure to its single [`ErrorKind`]
pub fn classify(failure: &Failure) -> ErrorKind {
    match failure {
        Failure::Exhaustion(_) => ErrorKind::OutOfMemory,
        Failure::Kv(e) => classify_kv(e),
        Failure::Sql(e) => classify_sql(e),
    }
}

fn classify_kv(e: &KvError) -> ErrorKind {
    if e.is_out_of_memory() {
        return ErrorKind::OutOfMemory;
    }
    match e {
        KvError::Poisoned(_) => ErrorKind::CorruptedState,
        KvError::Closed => ErrorKind::EngineClosed,
        _ if e.is_corruption() => ErrorKind::CorruptedState,
        _ => ErrorKind::GenericFailure,
    }
}

fn classify_sql(e: &SqlError) -> ErrorKind {
    if matches!(e, SqlError::Closed) {
        return ErrorKind::EngineClosed;
    }
    match e.code() {
        Some(SqliteErrorCode::OutOfMemory) => ErrorKind::OutOfMemory,
        Some(SqliteErrorCode::DatabaseCorrupt) | Some(SqliteErrorCode::NotADatabase) => {
            ErrorKind::CorruptedState
        }
        Some(SqliteErrorCode::ApiMisuse) => ErrorKind::EngineClosed,
        _ => ErrorKind::GenericFailure,
    }
}

fn disallowed(
    scenario: &str,
    step: &str,
    kind: ErrorKind,
    allow: AllowSet,
    failure: &Failure,
) -> ScenarioError {
    ScenarioError::Disallowed {
        scenario: scenario.to_string(),
        step: step.to_string(),
        observed: kind,
        allowed: allow,
        detail: failure.to_string(),
    }
}

/// Classify an observed failure and check it against `allow`
///
/// For failures the caller does not own, such as one recorded in a fault
/// channel.
pub fn judge(
    scenario: &str,
    step: &str,
    failure: &Failure,
    allow: AllowSet,
) -> Result<ErrorKind, ScenarioError> {
    let kind = classify(failure);
    if !allow.contains(kind) {
        return Err(disallowed(scenario, step, kind, allow, failure));
    }
    info!(
        target: "strata::oom::oracle",
        scenario,
        step,
        kind = %kind,
        error = %failure,
        "Expected failure observed"
    );
    Ok(kind)
}

/// A step that must fail with a kind in `allow`
///
/// Returns the observed kind. Success is [`ScenarioError::UnexpectedSuccess`].
pub fn expect_failure<T, E>(
    scenario: &str,
    step: &str,
    outcome: Result<T, E>,
    allow: AllowSet,
) -> Result<ErrorKind, ScenarioError>
where
    E: Into<Failure>,
{
    match outcome {
        Ok(_) => Err(ScenarioError::UnexpectedSuccess {
            scenario: scenario.to_string(),
            step: step.to_string(),
        }),
        Err(e) => judge(scenario, step, &e.into(), allow),
    }
}

/// A step that may succeed or fail with a kind in `allow`
///
/// Returns `None` on success, the observed kind otherwise.
pub fn tolerate<T, E>(
    scenario: &str,
    step: &str,
    outcome: Result<T, E>,
    allow: AllowSet,
) -> Result<Option<ErrorKind>, ScenarioError>
where
    E: Into<Failure>,
{
    let failure = match outcome {
        Ok(_) => return Ok(None),
        Err(e) => e.into(),
    };
    let kind = classify(&failure);
    if !allow.contains(kind) {
        return Err(disallowed(scenario, step, kind, allow, &failure));
    }
    warn!(
        target: "strata::oom::oracle",
        scenario,
        step,
        kind = %kind,
        error = %failure,
        "Tolerated failure"
    );
    Ok(Some(kind))
}

/// A step that must succeed
///
/// Raw exhaustion here means recovery did not restore a usable heap, which is
/// [`ScenarioError::Fatal`]; any other failure is [`ScenarioError::Step`].
pub fn require<T, E>(scenario: &str, step: &str, outcome: Result<T, E>) -> Result<T, ScenarioError>
where
    E: Into<Failure>,
{
    outcome.map_err(|e| {
        let failure = e.into();
        if failure.is_raw_exhaustion() {
            ScenarioError::Fatal {
                scenario: scenario.to_string(),
                step: step.to_string(),
                detail: failure.to_string(),
            }
        } else {
            ScenarioError::Step {
                scenario: scenario.to_string(),
                step: step.to_string(),
                kind: classify(&failure),
                detail: failure.to_string(),
            }
        }
    })
}

/// Post-recovery check: `actual` must equal `expected` exactly
pub fn assert_post_condition<T>(
    scenario: &str,
    check: &str,
    actual: T,
    expected: T,
) -> Result<(), ScenarioError>
where
    T: PartialEq + fmt::Debug,
{
    if actual == expected {
        return Ok(());
    }
    Err(ScenarioError::PostCondition {
        scenario: scenario.to_string(),
        check: check.to_string(),
        expected: format!("{:?}", expected),
        actual: format!("{:?}", actual),
    })
}
