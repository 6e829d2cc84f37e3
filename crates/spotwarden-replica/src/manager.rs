//! Replica manager: create, progress, promote, terminate.
//!
//! Replica records and the instance arena live in the state store. Every
//! mutation is persisted before the next provider call so a crash leaves a
//! record of what was in flight.

use std::sync::Arc;

use tracing::{debug, info, warn};

use spotwarden_core::{
    Clock, Instance, InstanceRole, InstanceStatus, Lifecycle, PoolKey, Replica, ReplicaConfig,
    ReplicaOrigin, ReplicaStatus, SyncStatus, Urgency, next_record_id,
};
use spotwarden_provider::{Executor, LaunchSpec, RetryPolicy};
use spotwarden_state::{StateError, StateStore};

use crate::error::{ReplicaError, ReplicaResult};
use crate::lifecycle::{self, ProgressReport};

/// Result of a successful promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub replica: Replica,
    /// The superseded parent (zombie, or terminated per config).
    pub old_primary: Instance,
    pub new_primary: Instance,
}

#[derive(Clone)]
pub struct ReplicaManager {
    store: StateStore,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    config: ReplicaConfig,
    retry: RetryPolicy,
}

impl ReplicaManager {
    pub fn new(
        store: StateStore,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        config: ReplicaConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            config,
            retry,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn get(&self, replica_id: &str) -> ReplicaResult<Replica> {
        self.store
            .get_replica(replica_id)?
            .ok_or_else(|| ReplicaError::NotFound(replica_id.to_string()))
    }

    pub fn list_for_workload(&self, workload_id: &str) -> ReplicaResult<Vec<Replica>> {
        Ok(self.store.list_replicas_for_workload(workload_id)?)
    }

    /// The parent's current (non-terminal) replica, newest first.
    pub fn current_for_parent(&self, parent_instance_id: &str) -> ReplicaResult<Option<Replica>> {
        Ok(self
            .store
            .list_replicas_for_parent(parent_instance_id)?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))))
    }

    /// The ready replica that a promotion would pick.
    pub fn select_for_promotion(&self, parent_instance_id: &str) -> ReplicaResult<Option<Replica>> {
        let replicas = self.store.list_replicas_for_parent(parent_instance_id)?;
        Ok(lifecycle::select_for_promotion(&replicas).cloned())
    }

    /// Launch a standby for a live primary, in `target_pool` or the cheapest
    /// compatible pool.
    pub async fn create(
        &self,
        parent_instance_id: &str,
        target_pool: Option<PoolKey>,
        origin: ReplicaOrigin,
        urgency: Urgency,
    ) -> ReplicaResult<Replica> {
        if origin == ReplicaOrigin::Manual && !self.config.manual_replicas_enabled {
            return Err(ReplicaError::ManualDisabled);
        }
        let parent = self
            .store
            .get_instance(parent_instance_id)?
            .ok_or_else(|| ReplicaError::ParentNotFound(parent_instance_id.to_string()))?;
        if !parent.is_live_primary() {
            return Err(ReplicaError::ParentNotPrimary(parent.id));
        }
        if let Some(existing) = self.current_for_parent(&parent.id)? {
            return Err(ReplicaError::SlotOccupied {
                parent: parent.id,
                existing: existing.id,
            });
        }

        let pool = match target_pool {
            Some(pool) => pool,
            None => self.cheapest_compatible_pool(&parent).await?,
        };

        let now = self.clock.now();
        let mut replica = Replica {
            id: next_record_id("rep"),
            workload_id: parent.workload_id.clone(),
            parent_instance_id: parent.id.clone(),
            instance_id: None,
            pool: Some(pool.clone()),
            status: ReplicaStatus::Launching,
            sync_status: SyncStatus::Initializing,
            sync_latency_ms: 0,
            transfer_progress: 0,
            created_by: origin,
            urgency,
            created_at: now,
            ready_at: None,
            updated_at: now,
            failure_reason: None,
        };
        // The early check above can go stale across the pricing call.
        match self.store.reserve_replica_slot(&replica) {
            Ok(()) => {}
            Err(StateError::ReplicaSlotOccupied { parent, existing }) => {
                debug!(parent = %parent, existing = %existing, origin = ?origin, "replica slot taken meanwhile");
                return Err(ReplicaError::SlotOccupied { parent, existing });
            }
            Err(e) => return Err(ReplicaError::State(e)),
        }

        let spec = LaunchSpec {
            workload_id: parent.workload_id.clone(),
            instance_type: pool.instance_type.clone(),
            region: pool.region.clone(),
            az: pool.az.clone(),
            lifecycle: Lifecycle::Spot,
            role: InstanceRole::Replica,
        };
        let instance_id = match self
            .retry
            .run("launch_instance", || self.executor.launch_instance(&spec))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(replica = %replica.id, pool = %pool, error = %e, "replica launch failed");
                lifecycle::transition(&mut replica, ReplicaStatus::Failed, self.clock.now())?;
                replica.failure_reason = Some(format!("launch failed: {e}"));
                self.store.put_replica(&replica)?;
                return Err(e.into());
            }
        };

        self.store.put_instance(&Instance {
            id: instance_id.clone(),
            workload_id: parent.workload_id.clone(),
            instance_type: pool.instance_type.clone(),
            region: pool.region.clone(),
            az: pool.az.clone(),
            lifecycle: Lifecycle::Spot,
            role: InstanceRole::Replica,
            status: InstanceStatus::Pending,
            created_at: now,
            terminated_at: None,
        })?;
        replica.instance_id = Some(instance_id.clone());
        replica.updated_at = self.clock.now();
        self.store.put_replica(&replica)?;

        info!(
            replica = %replica.id,
            parent = %parent.id,
            instance = %instance_id,
            pool = %pool,
            origin = ?origin,
            urgency = ?urgency,
            "replica launching"
        );
        Ok(replica)
    }

    /// Cheapest pool of the parent's type in its region, other than the
    /// parent's own pool unless nothing else is priced.
    async fn cheapest_compatible_pool(&self, parent: &Instance) -> ReplicaResult<PoolKey> {
        let snapshot = self
            .retry
            .run("get_pricing_snapshot", || {
                self.executor
                    .get_pricing_snapshot(&parent.instance_type, &parent.region, &[])
            })
            .await?;
        let own = parent.pool_key();
        let mut compatible: Vec<_> = snapshot
            .pools
            .iter()
            .filter(|p| p.key.instance_type == parent.instance_type && p.key.region == parent.region)
            .collect();
        compatible.sort_by(|a, b| {
            (a.key == own)
                .cmp(&(b.key == own))
                .then(a.spot_price.total_cmp(&b.spot_price))
                .then_with(|| a.key.cmp(&b.key))
        });
        compatible
            .first()
            .map(|p| p.key.clone())
            .ok_or_else(|| ReplicaError::NoCompatiblePool(parent.instance_type.clone()))
    }

    /// Apply an agent progress report.
    pub fn report_progress(&self, replica_id: &str, report: &ProgressReport) -> ReplicaResult<Replica> {
        let mut replica = self.get(replica_id)?;
        let before = replica.status;
        lifecycle::apply_progress(&mut replica, report, self.clock.now())?;
        self.store.put_replica(&replica)?;

        if before != replica.status {
            info!(replica = %replica.id, from = %before, to = %replica.status, "replica status changed");
            if before == ReplicaStatus::Launching {
                self.mark_backing_running(&replica)?;
            }
        } else {
            debug!(replica = %replica.id, progress = replica.transfer_progress, "replica progress");
        }
        Ok(replica)
    }

    fn mark_backing_running(&self, replica: &Replica) -> ReplicaResult<()> {
        let Some(id) = &replica.instance_id else {
            return Ok(());
        };
        if let Some(mut inst) = self.store.get_instance(id)? {
            if inst.status == InstanceStatus::Pending {
                inst.status = InstanceStatus::Running;
                self.store.put_instance(&inst)?;
            }
        }
        Ok(())
    }

    /// Re-tag an existing replica as the emergency standby.
    pub fn adopt_for_emergency(&self, mut replica: Replica) -> ReplicaResult<Replica> {
        replica.urgency = Urgency::High;
        replica.updated_at = self.clock.now();
        self.store.put_replica(&replica)?;
        info!(replica = %replica.id, status = %replica.status, "replica adopted as emergency standby");
        Ok(replica)
    }

    /// Operator or automatic termination of a non-terminal replica.
    pub async fn terminate(&self, replica_id: &str, reason: &str) -> ReplicaResult<Replica> {
        let replica = self.get(replica_id)?;
        self.release(replica, ReplicaStatus::Terminated, reason).await
    }

    /// Mark a replica failed and release its instance.
    pub async fn fail(&self, replica_id: &str, reason: &str) -> ReplicaResult<Replica> {
        let replica = self.get(replica_id)?;
        self.release(replica, ReplicaStatus::Failed, reason).await
    }

    /// Terminate every non-terminal replica of a workload.
    pub async fn terminate_all(&self, workload_id: &str, reason: &str) -> ReplicaResult<Vec<Replica>> {
        let mut released = Vec::new();
        for replica in self.store.list_replicas_for_workload(workload_id)? {
            if !replica.status.is_terminal() {
                released.push(self.release(replica, ReplicaStatus::Terminated, reason).await?);
            }
        }
        Ok(released)
    }

    pub(crate) async fn release(
        &self,
        mut replica: Replica,
        status: ReplicaStatus,
        reason: &str,
    ) -> ReplicaResult<Replica> {
        if replica.status.is_terminal() {
            return Err(ReplicaError::Terminal {
                id: replica.id,
                status: replica.status,
            });
        }
        if let Some(instance_id) = replica.instance_id.clone() {
            self.terminate_instance(&instance_id).await?;
        }
        lifecycle::transition(&mut replica, status, self.clock.now())?;
        replica.failure_reason = Some(reason.to_string());
        self.store.put_replica(&replica)?;
        info!(replica = %replica.id, status = %status, reason, "replica released");
        Ok(replica)
    }

    /// Best-effort provider termination; the arena is updated only when the
    /// provider confirms.
    pub(crate) async fn terminate_instance(&self, instance_id: &str) -> ReplicaResult<bool> {
        let confirmed = match self.executor.terminate_instance(instance_id).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "terminate failed");
                false
            }
        };
        if confirmed {
            if let Some(mut inst) = self.store.get_instance(instance_id)? {
                inst.mark_terminated(self.clock.now());
                self.store.put_instance(&inst)?;
            }
        } else {
            warn!(instance = %instance_id, "provider did not confirm termination");
        }
        Ok(confirmed)
    }

    /// Promote a ready replica to primary.
    ///
    /// Fails with `NotReady` (state untouched) unless the replica is ready.
    /// If the replica's instance does not reach running within the
    /// promotion timeout it is failed and released, and the parent keeps
    /// its role.
    pub async fn promote(&self, replica_id: &str) -> ReplicaResult<Promotion> {
        let mut replica = self.get(replica_id)?;
        if replica.status != ReplicaStatus::Ready {
            return Err(ReplicaError::NotReady {
                id: replica.id,
                status: replica.status,
            });
        }
        let Some(instance_id) = replica.instance_id.clone() else {
            return Err(ReplicaError::PromotionFailed(format!(
                "replica {} has no backing instance",
                replica.id
            )));
        };
        let parent = self
            .store
            .get_instance(&replica.parent_instance_id)?
            .ok_or_else(|| ReplicaError::ParentNotFound(replica.parent_instance_id.clone()))?;
        let mut new_primary = self.store.get_instance(&instance_id)?.ok_or_else(|| {
            ReplicaError::PromotionFailed(format!("backing instance {instance_id} not in arena"))
        })?;

        let timeout = self.config.promotion_timeout();
        let running = match self
            .executor
            .wait_for_instance_state(&instance_id, InstanceStatus::Running, timeout)
            .await
        {
            Ok(running) => running,
            Err(e) => {
                warn!(replica = %replica.id, error = %e, "wait for running failed");
                false
            }
        };
        if !running {
            let id = replica.id.clone();
            self.release(replica, ReplicaStatus::Failed, "did not reach running within promotion timeout")
                .await?;
            return Err(ReplicaError::PromotionTimeout {
                id,
                timeout_secs: self.config.promotion_timeout_secs,
            });
        }

        let now = self.clock.now();
        // Demote first so the arena never holds two live primaries.
        let mut old_primary = parent;
        old_primary.role = InstanceRole::Zombie;
        if self.config.terminate_parent_on_promotion && self.terminate_instance(&old_primary.id).await? {
            old_primary.mark_terminated(now);
        }
        self.store.put_instance(&old_primary)?;

        new_primary.role = InstanceRole::Primary;
        new_primary.status = InstanceStatus::Running;
        self.store.put_instance(&new_primary)?;

        lifecycle::transition(&mut replica, ReplicaStatus::Promoted, now)?;
        self.store.put_replica(&replica)?;
        info!(
            replica = %replica.id,
            old_primary = %old_primary.id,
            new_primary = %new_primary.id,
            "replica promoted"
        );

        for other in self.store.list_replicas_for_parent(&old_primary.id)? {
            if other.id != replica.id && !other.status.is_terminal() {
                let reason = format!("superseded by promotion of {}", replica.id);
                self.release(other, ReplicaStatus::Terminated, &reason).await?;
            }
        }

        Ok(Promotion {
            replica,
            old_primary,
            new_primary,
        })
    }
}
