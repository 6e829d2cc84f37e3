//! Provider error taxonomy.

use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Failures of an `Executor` or `WorkloadAgent` call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limit, throttling, 5xx: safe to retry with backoff.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Permission denied, resource not found: retrying will not help.
    #[error("fatal provider failure: {0}")]
    Fatal(String),

    #[error("provider call timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Failures of the price oracle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForecastError {
    #[error("forecast unavailable: {0}")]
    Unavailable(String),
}
