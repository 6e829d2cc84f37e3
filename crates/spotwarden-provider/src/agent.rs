//! The on-instance workload agent seam.

use std::time::Duration;

use crate::executor::ProviderFuture;

/// Agent running next to the workload on primaries and replicas.
pub trait WorkloadAgent: Send + Sync {
    /// Stop background jobs, batch work, and anything not serving traffic.
    fn halt_non_critical<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Ship the last state delta from `primary` to `replica` within `budget`.
    fn transfer_final_delta<'a>(
        &'a self,
        primary: &'a str,
        replica: &'a str,
        budget: Duration,
    ) -> ProviderFuture<'a, ()>;

    /// Persist a minimal snapshot off-instance. Returns a snapshot reference.
    fn persist_emergency_snapshot<'a>(&'a self, primary: &'a str) -> ProviderFuture<'a, String>;
}
