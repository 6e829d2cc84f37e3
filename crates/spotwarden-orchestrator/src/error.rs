//! Orchestration error types.

use thiserror::Error;

use spotwarden_replica::ReplicaError;
use spotwarden_safety::LeaseBusy;
use spotwarden_state::StateError;

/// Errors that stop a cycle or a signal handler before it can record an
/// outcome. Provider failures are not here: they end up in the audit log.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Busy(#[from] LeaseBusy),

    #[error("workload {0} has no live primary")]
    NoPrimary(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
}

pub type CycleResult<T> = Result<T, CycleError>;
