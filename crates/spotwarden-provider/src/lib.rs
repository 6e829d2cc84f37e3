//! spotwarden-provider — the external collaborators the core talks to.
//!
//! The decision engine and the failover state machine never call a cloud
//! SDK directly. They go through three object-safe traits:
//!
//! - **`Executor`**: instance state, usage metrics, pricing snapshot,
//!   launch, terminate, wait-for-state
//! - **`PriceOracle`**: one-hour-ahead price forecast per pool
//! - **`WorkloadAgent`**: the on-instance agent that halts work, ships the
//!   final state delta, and persists emergency snapshots
//!
//! Provider calls that fail transiently are retried through
//! [`RetryPolicy`]; fatal failures are surfaced immediately.
//!
//! The [`sim`] module is a deterministic in-memory provider used by tests
//! and by `spotwardend run --world`.

pub mod agent;
pub mod error;
pub mod executor;
pub mod oracle;
pub mod retry;
pub mod sim;

pub use agent::WorkloadAgent;
pub use error::{ForecastError, ProviderError, ProviderResult};
pub use executor::{Executor, InstanceDescription, LaunchSpec, ProviderFuture};
pub use oracle::{OracleFuture, PriceOracle};
pub use retry::RetryPolicy;
