//! spotwarden-safety — gates around the decision engine.
//!
//! - **Cooldown**: no decision-driven transition until `cooldown_until`.
//! - **Circuit breaker**: after N consecutive failed switches for a
//!   workload, auto-switching stays disabled until an operator resets it.
//! - **Leases**: one writer per workload at a time. Decision cycles and
//!   rebalance handling take a lease with `try_acquire` and are rejected
//!   while another holder is active; a termination notice uses `preempt`,
//!   which cancels the current holder and waits for it to let go.
//! - **Alerts**: breaker openings and manual-review flags go to an
//!   [`AlertSink`].
//!
//! All per-workload state is persisted as a `WorkloadControl` record so it
//! survives restarts.

pub mod alert;
pub mod breaker;
pub mod cooldown;
pub mod layer;
pub mod lease;

pub use alert::{Alert, AlertKind, AlertSink, RecordingAlertSink, TracingAlertSink};
pub use breaker::{BreakerOutcome, CircuitBreaker};
pub use layer::{Gate, SafetyLayer};
pub use lease::{Lease, LeaseBusy, LeaseKind, LeaseTable};
