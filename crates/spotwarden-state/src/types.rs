//! Store-local record types.
//!
//! Domain records (instances, replicas, audit events) come from
//! `spotwarden-core`; this module adds the per-workload control record
//! the safety layer persists between cycles.

use serde::{Deserialize, Serialize};

use spotwarden_core::WorkloadId;

/// Persisted safety state for one workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkloadControl {
    pub workload_id: WorkloadId,
    /// No new decision-driven transition before this unix timestamp.
    pub cooldown_until: Option<u64>,
    /// Consecutive failed switch attempts.
    pub consecutive_failures: u32,
    /// Breaker open: auto-switching disabled until manual reset.
    pub breaker_open: bool,
    pub breaker_opened_at: Option<u64>,
    /// Set after a fatal executor failure; automation skips the workload.
    pub manual_review: Option<String>,
    pub updated_at: u64,
}

impl WorkloadControl {
    pub fn new(workload_id: &str) -> Self {
        Self {
            workload_id: workload_id.to_string(),
            ..Default::default()
        }
    }
}

/// Build the audit table key for a workload and sequence number.
pub fn audit_key(workload_id: &str, seq: u64) -> String {
    format!("{workload_id}:{seq:020}")
}
