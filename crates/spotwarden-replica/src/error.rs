use thiserror::Error;

use spotwarden_core::ReplicaStatus;
use spotwarden_provider::ProviderError;
use spotwarden_state::StateError;

pub type ReplicaResult<T> = Result<T, ReplicaError>;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("replica {0} not found")]
    NotFound(String),

    #[error("parent instance {0} not found")]
    ParentNotFound(String),

    #[error("instance {0} is not a live primary")]
    ParentNotPrimary(String),

    #[error("replica {id} is {status}; promotion requires ready")]
    NotReady { id: String, status: ReplicaStatus },

    #[error("replica {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ReplicaStatus,
        to: ReplicaStatus,
    },

    #[error("replica {id} is already {status}")]
    Terminal { id: String, status: ReplicaStatus },

    #[error("instance {parent} already has replica {existing}")]
    SlotOccupied { parent: String, existing: String },

    #[error("manual replicas are disabled")]
    ManualDisabled,

    #[error("no compatible pool for {0}")]
    NoCompatiblePool(String),

    #[error("replica {id} did not reach running within {timeout_secs}s")]
    PromotionTimeout { id: String, timeout_secs: u64 },

    #[error("promotion failed: {0}")]
    PromotionFailed(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
