//! Pure replica state transitions.

use serde::{Deserialize, Serialize};

use spotwarden_core::{Replica, ReplicaStatus, SyncStatus};

use crate::error::{ReplicaError, ReplicaResult};

/// Progress report from the replica's agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub sync_status: SyncStatus,
    pub transfer_progress: u8,
    #[serde(default)]
    pub sync_latency_ms: u64,
}

pub fn can_transition(from: ReplicaStatus, to: ReplicaStatus) -> bool {
    use ReplicaStatus::*;
    match (from, to) {
        (Launching, Syncing) | (Syncing, Ready) | (Ready, Syncing) | (Ready, Promoted) => true,
        (from, Failed | Terminated) => !from.is_terminal(),
        _ => false,
    }
}

pub fn transition(replica: &mut Replica, to: ReplicaStatus, now: u64) -> ReplicaResult<()> {
    if !can_transition(replica.status, to) {
        return Err(ReplicaError::InvalidTransition {
            id: replica.id.clone(),
            from: replica.status,
            to,
        });
    }
    replica.status = to;
    replica.updated_at = now;
    if to == ReplicaStatus::Ready {
        replica.ready_at = Some(now);
    }
    Ok(())
}

/// Fold a progress report into the replica. A ready replica that falls out
/// of sync drops back to syncing.
pub fn apply_progress(replica: &mut Replica, report: &ProgressReport, now: u64) -> ReplicaResult<()> {
    if replica.status.is_terminal() {
        return Err(ReplicaError::Terminal {
            id: replica.id.clone(),
            status: replica.status,
        });
    }
    replica.sync_status = report.sync_status;
    replica.transfer_progress = report.transfer_progress.min(100);
    replica.sync_latency_ms = report.sync_latency_ms;
    replica.updated_at = now;

    if replica.status == ReplicaStatus::Launching {
        transition(replica, ReplicaStatus::Syncing, now)?;
    }
    let caught_up = replica.sync_status == SyncStatus::Synced && replica.transfer_progress == 100;
    match replica.status {
        ReplicaStatus::Syncing if caught_up => transition(replica, ReplicaStatus::Ready, now),
        ReplicaStatus::Ready if !caught_up => transition(replica, ReplicaStatus::Syncing, now),
        _ => Ok(()),
    }
}

/// Pick the one ready replica to promote: newest first, larger id on a tie.
pub fn select_for_promotion(replicas: &[Replica]) -> Option<&Replica> {
    replicas
        .iter()
        .filter(|r| r.status == ReplicaStatus::Ready)
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
}
