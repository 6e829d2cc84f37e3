//! spotwarden-orchestrator — drives the engine and the failover state
//! machine against the provider.
//!
//! - [`DecisionCycle`] runs one gated, audited decision cycle for one
//!   workload under that workload's lease.
//! - [`Dispatcher`] is the single place an action reaches the executor;
//!   dry-run mode stops it there.
//! - [`ControlPlane`] runs cycles for every protected workload on an
//!   interval and routes interruption signals to the failover coordinator.

pub mod control;
pub mod cycle;
pub mod dispatch;
pub mod error;

pub use control::ControlPlane;
pub use cycle::{BREAKER_GATE, CycleOutcome, DecisionCycle, PREEMPTED_GATE};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{CycleError, CycleResult};
