//! spotwarden-replica — standby replicas and interruption failover.
//!
//! # Replica lifecycle
//!
//! ```text
//! launching ──► syncing ◄──► ready ──► promoted
//!     │            │           │
//!     └────────────┴───────────┴──► failed | terminated
//! ```
//!
//! Agent progress reports drive `launching → syncing → ready`; `ready`
//! requires `synced` and a complete initial transfer. `promote` only
//! accepts a ready replica.
//!
//! # Interruption handling
//!
//! - **Rebalance recommendation**: estimate the interruption probability
//!   and, above the threshold, start (or adopt) an emergency replica that
//!   syncs in the background.
//! - **Termination notice**: halt non-critical work, promote the newest
//!   ready replica after shipping the final delta, or fall back to an
//!   emergency snapshot plus a fresh on-demand launch. Either way exactly
//!   one `InterruptionEvent` closes the signal.

pub mod error;
pub mod failover;
pub mod heuristic;
pub mod lifecycle;
pub mod manager;
pub mod signals;

pub use error::{ReplicaError, ReplicaResult};
pub use failover::{FailoverCoordinator, FailoverReport};
pub use heuristic::{InterruptionFactors, hour_of_day, interruption_probability};
pub use lifecycle::{ProgressReport, can_transition, select_for_promotion};
pub use manager::{Promotion, ReplicaManager};
pub use signals::{ChannelSignalSource, InterruptionSignal, SignalFuture, SignalSource};
