//! Interruption handling.
//!
//! A rebalance recommendation may start an emergency replica in the
//! background. A termination notice runs the critical path: halt the
//! primary, promote the ready replica if one exists, otherwise persist a
//! snapshot and launch a fresh on-demand primary. Every signal closes
//! with exactly one `InterruptionEvent`, including signals that could not
//! be handled at all.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use spotwarden_core::{
    Instance, InstanceId, InstanceRole, InstanceStatus, InterruptionEvent, Lifecycle, PoolKey,
    PoolPrice, Replica, ReplicaOrigin, ReplicaStatus, ResponseAction, SwitchEvent, SwitchTrigger,
    Urgency, next_record_id,
};
use spotwarden_provider::{LaunchSpec, WorkloadAgent};
use spotwarden_safety::Lease;

use crate::error::{ReplicaError, ReplicaResult};
use crate::heuristic::{InterruptionFactors, hour_of_day, interruption_probability};
use crate::manager::ReplicaManager;
use crate::signals::InterruptionSignal;

/// Outcome of one handled signal, as appended to the audit store.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverReport {
    pub event: InterruptionEvent,
    pub switch_event: Option<SwitchEvent>,
    /// Primary serving the workload after handling, when it changed.
    pub new_primary: Option<InstanceId>,
}

#[derive(Clone)]
pub struct FailoverCoordinator {
    manager: ReplicaManager,
    agent: Arc<dyn WorkloadAgent>,
}

impl FailoverCoordinator {
    pub fn new(manager: ReplicaManager, agent: Arc<dyn WorkloadAgent>) -> Self {
        Self { manager, agent }
    }

    pub fn manager(&self) -> &ReplicaManager {
        &self.manager
    }

    /// Soft warning. Never blocks on a replica becoming ready.
    pub async fn handle_rebalance(
        &self,
        signal: &InterruptionSignal,
        lease: &Lease,
    ) -> ReplicaResult<FailoverReport> {
        let result = self.respond_to_rebalance(signal, lease).await;
        self.audit_failure(signal, result)
    }

    /// Hard deadline. Runs regardless of the automatic defense setting.
    pub async fn handle_termination_notice(
        &self,
        signal: &InterruptionSignal,
    ) -> ReplicaResult<FailoverReport> {
        let result = self.respond_to_termination(signal).await;
        self.audit_failure(signal, result)
    }

    /// Close a signal that could not be handled with a failed event.
    pub fn record_unhandled(&self, signal: &InterruptionSignal, reason: &str) -> Option<InterruptionEvent> {
        let event = interruption_event(
            signal,
            ResponseAction::Unhandled,
            None,
            false,
            format!("signal not handled: {reason}"),
        );
        match self.manager.store().append_interruption_event(&event) {
            Ok(_) => {
                warn!(
                    workload = %signal.workload_id,
                    instance = %signal.instance_id,
                    signal = %signal.kind,
                    reason,
                    "interruption signal not handled"
                );
                Some(event)
            }
            Err(e) => {
                error!(
                    workload = %signal.workload_id,
                    signal = %signal.kind,
                    error = %e,
                    "recording unhandled signal failed"
                );
                None
            }
        }
    }

    /// Errors surface before `close` appends anything, so a failed result
    /// still owes the audit log its event.
    fn audit_failure(
        &self,
        signal: &InterruptionSignal,
        result: ReplicaResult<FailoverReport>,
    ) -> ReplicaResult<FailoverReport> {
        if let Err(e) = &result {
            self.record_unhandled(signal, &e.to_string());
        }
        result
    }

    async fn respond_to_rebalance(
        &self,
        signal: &InterruptionSignal,
        lease: &Lease,
    ) -> ReplicaResult<FailoverReport> {
        let config = self.manager.config();
        if !config.auto_defense_enabled {
            let event = interruption_event(
                signal,
                ResponseAction::DefenseDisabled,
                None,
                true,
                "automatic interruption defense disabled".to_string(),
            );
            return self.close(event, None, None);
        }

        let primary = self.live_primary(signal)?;
        let rate = self.pool_interruption_rate(&primary).await;
        let factors = InterruptionFactors {
            instance_age_secs: signal.detected_at.saturating_sub(primary.created_at),
            pool_interruption_rate: rate,
            hour_utc: hour_of_day(signal.detected_at),
        };
        let probability = interruption_probability(&config.heuristic, &factors);
        info!(
            workload = %signal.workload_id,
            instance = %primary.id,
            probability,
            threshold = config.emergency_probability_threshold,
            "rebalance recommendation"
        );

        let mut event = if probability <= config.emergency_probability_threshold {
            interruption_event(
                signal,
                ResponseAction::NoReplicaNeeded,
                None,
                true,
                format!(
                    "interruption probability {probability:.2} at or below threshold {:.2}",
                    config.emergency_probability_threshold
                ),
            )
        } else if let Some(existing) = self.manager.current_for_parent(&primary.id)? {
            let adopted = self.manager.adopt_for_emergency(existing)?;
            interruption_event(
                signal,
                ResponseAction::EmergencyReplicaAdopted,
                Some(adopted.id.clone()),
                true,
                format!("existing replica {} ({}) adopted", adopted.id, adopted.status),
            )
        } else if lease.is_cancelled() {
            preempted_event(signal)
        } else {
            tokio::select! {
                biased;
                _ = lease.cancelled() => preempted_event(signal),
                created = self.manager.create(&primary.id, None, ReplicaOrigin::Automatic, Urgency::High) => {
                    match created {
                        Ok(replica) => interruption_event(
                            signal,
                            ResponseAction::EmergencyReplicaCreated,
                            Some(replica.id.clone()),
                            true,
                            format!("emergency replica {} launching", replica.id),
                        ),
                        Err(ReplicaError::State(e)) => return Err(ReplicaError::State(e)),
                        // A manual create won the slot meanwhile; automatic takes it over.
                        Err(ReplicaError::SlotOccupied { existing, .. }) => {
                            let adopted = self.manager.adopt_for_emergency(self.manager.get(&existing)?)?;
                            interruption_event(
                                signal,
                                ResponseAction::EmergencyReplicaAdopted,
                                Some(adopted.id.clone()),
                                true,
                                format!("concurrent replica {} ({}) adopted", adopted.id, adopted.status),
                            )
                        }
                        Err(e) => {
                            warn!(workload = %signal.workload_id, error = %e, "emergency replica creation failed");
                            interruption_event(
                                signal,
                                ResponseAction::ReplicaCreationFailed,
                                None,
                                false,
                                format!("emergency replica creation failed: {e}"),
                            )
                        }
                    }
                }
            }
        };
        event.probability = Some(probability);
        self.close(event, None, None)
    }

    async fn respond_to_termination(&self, signal: &InterruptionSignal) -> ReplicaResult<FailoverReport> {
        let primary = self.live_primary(signal)?;
        info!(
            workload = %signal.workload_id,
            instance = %primary.id,
            deadline = signal.deadline,
            "termination notice"
        );
        if let Err(e) = self.agent.halt_non_critical(&primary.id).await {
            warn!(instance = %primary.id, error = %e, "halting non-critical work failed");
        }

        let note = match self.manager.select_for_promotion(&primary.id)? {
            Some(replica) => match self.promote_path(signal, &primary, replica).await? {
                Ok(report) => return Ok(report),
                Err(note) => note,
            },
            None => "no ready replica".to_string(),
        };
        self.degraded_path(signal, &primary, note).await
    }

    /// Transfer the final delta and promote. `Ok(Err(note))` sends the
    /// caller down the degraded path.
    async fn promote_path(
        &self,
        signal: &InterruptionSignal,
        primary: &Instance,
        replica: Replica,
    ) -> ReplicaResult<Result<FailoverReport, String>> {
        let config = self.manager.config();
        let now = self.manager.clock().now();
        let reserve = config.promotion_timeout_secs + config.drain_margin_secs;
        let budget_secs = signal.deadline.saturating_sub(now).saturating_sub(reserve);
        let Some(replica_instance) = replica.instance_id.clone() else {
            return Ok(Err(format!("replica {} has no backing instance", replica.id)));
        };

        if budget_secs == 0 {
            let note = format!("no time left to transfer state to replica {}", replica.id);
            self.manager.fail(&replica.id, &note).await?;
            return Ok(Err(note));
        }
        let budget = Duration::from_secs(budget_secs);
        let transfer = tokio::time::timeout(
            budget,
            self.agent
                .transfer_final_delta(&primary.id, &replica_instance, budget),
        )
        .await;
        let transfer_error = match transfer {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("exceeded {budget_secs}s budget")),
        };
        if let Some(e) = transfer_error {
            warn!(replica = %replica.id, error = %e, "final delta transfer failed");
            let note = format!("final delta transfer to replica {} failed: {e}", replica.id);
            self.manager.fail(&replica.id, &note).await?;
            return Ok(Err(note));
        }

        let promotion = match self.manager.promote(&replica.id).await {
            Ok(promotion) => promotion,
            Err(ReplicaError::State(e)) => return Err(ReplicaError::State(e)),
            Err(e) => {
                warn!(replica = %replica.id, error = %e, "promotion failed");
                return Ok(Err(format!("promotion of replica {} failed: {e}", replica.id)));
            }
        };

        let prices = self
            .prices(
                primary,
                &[primary.pool_key(), promotion.new_primary.pool_key()],
            )
            .await;
        let old_price = spot_price(&prices, &primary.pool_key()).unwrap_or(0.0);
        let new_price = spot_price(&prices, &promotion.new_primary.pool_key());
        let switch = SwitchEvent {
            id: next_record_id("sw"),
            workload_id: signal.workload_id.clone(),
            old_instance_id: primary.id.clone(),
            new_instance_id: Some(promotion.new_primary.id.clone()),
            trigger: SwitchTrigger::Interruption,
            reason: format!("termination notice; promoted replica {}", promotion.replica.id),
            old_price,
            new_price,
            savings_per_hour: new_price.map_or(0.0, |p| old_price - p),
            downtime_seconds: 0.0,
            success: true,
            recorded_at: self.manager.clock().now(),
        };
        let event = interruption_event(
            signal,
            ResponseAction::ReplicaPromoted,
            Some(promotion.replica.id.clone()),
            true,
            format!(
                "replica {} promoted to primary {}",
                promotion.replica.id, promotion.new_primary.id
            ),
        );
        self.close(event, Some(switch), Some(promotion.new_primary.id)).map(Ok)
    }

    /// Snapshot the primary and bring up a fresh on-demand instance.
    async fn degraded_path(
        &self,
        signal: &InterruptionSignal,
        primary: &Instance,
        note: String,
    ) -> ReplicaResult<FailoverReport> {
        warn!(workload = %signal.workload_id, instance = %primary.id, %note, "taking degraded path");
        let config = self.manager.config();
        let store = self.manager.store();

        let snapshot = match self.agent.persist_emergency_snapshot(&primary.id).await {
            Ok(reference) => Ok(reference),
            Err(e) => {
                warn!(instance = %primary.id, error = %e, "emergency snapshot failed");
                Err(e.to_string())
            }
        };

        for replica in store.list_replicas_for_parent(&primary.id)? {
            if !replica.status.is_terminal() {
                self.manager
                    .release(replica, ReplicaStatus::Terminated, "superseded by emergency snapshot")
                    .await?;
            }
        }

        let spec = LaunchSpec {
            workload_id: primary.workload_id.clone(),
            instance_type: primary.instance_type.clone(),
            region: primary.region.clone(),
            az: primary.az.clone(),
            lifecycle: Lifecycle::OnDemand,
            role: InstanceRole::Primary,
        };
        let executor = self.manager.executor();
        let launched = self
            .manager
            .retry()
            .run("launch_instance", || executor.launch_instance(&spec))
            .await;
        let replacement = match launched {
            Ok(id) => {
                let running = executor
                    .wait_for_instance_state(&id, InstanceStatus::Running, config.degraded_launch_timeout())
                    .await
                    .unwrap_or(false);
                if running {
                    Ok(id)
                } else {
                    self.manager.terminate_instance(&id).await?;
                    Err(format!(
                        "replacement {id} not running within {}s",
                        config.degraded_launch_timeout_secs
                    ))
                }
            }
            Err(e) => Err(format!("replacement launch failed: {e}")),
        };

        let now = self.manager.clock().now();
        if let Ok(id) = &replacement {
            let mut old = primary.clone();
            old.role = InstanceRole::Zombie;
            store.put_instance(&old)?;
            store.put_instance(&Instance {
                id: id.clone(),
                workload_id: primary.workload_id.clone(),
                instance_type: primary.instance_type.clone(),
                region: primary.region.clone(),
                az: primary.az.clone(),
                lifecycle: Lifecycle::OnDemand,
                role: InstanceRole::Primary,
                status: InstanceStatus::Running,
                created_at: now,
                terminated_at: None,
            })?;
        }

        // Service is lost at the deadline at the latest and comes back once
        // the workload restores from the snapshot.
        let downtime = now.saturating_sub(signal.deadline) + config.degraded_restore_secs.max(1);
        let success = snapshot.is_ok() && replacement.is_ok();

        let mut reason = note;
        match &snapshot {
            Ok(reference) => reason.push_str(&format!("; snapshot {reference} persisted")),
            Err(e) => reason.push_str(&format!("; snapshot failed: {e}")),
        }
        match &replacement {
            Ok(id) => reason.push_str(&format!("; on-demand replacement {id} running")),
            Err(e) => reason.push_str(&format!("; {e}")),
        }

        let new_primary = replacement.ok();
        let prices = self.prices(primary, &[]).await;
        let old_price = spot_price(&prices, &primary.pool_key()).unwrap_or(0.0);
        let new_price = new_primary.as_ref().and_then(|_| {
            prices
                .iter()
                .find(|p| p.key == primary.pool_key())
                .map(|p| p.on_demand_price)
        });
        let switch = SwitchEvent {
            id: next_record_id("sw"),
            workload_id: signal.workload_id.clone(),
            old_instance_id: primary.id.clone(),
            new_instance_id: new_primary.clone(),
            trigger: SwitchTrigger::Interruption,
            reason: reason.clone(),
            old_price,
            new_price,
            savings_per_hour: new_price.map_or(0.0, |p| old_price - p),
            downtime_seconds: downtime as f64,
            success,
            recorded_at: now,
        };
        let event = interruption_event(signal, ResponseAction::EmergencySnapshot, None, success, reason);
        self.close(event, Some(switch), new_primary)
    }

    fn live_primary(&self, signal: &InterruptionSignal) -> ReplicaResult<Instance> {
        self.manager
            .store()
            .get_instance(&signal.instance_id)?
            .filter(Instance::is_live_primary)
            .ok_or_else(|| ReplicaError::ParentNotPrimary(signal.instance_id.clone()))
    }

    async fn pool_interruption_rate(&self, primary: &Instance) -> f64 {
        let key = primary.pool_key();
        self.prices(primary, std::slice::from_ref(&key))
            .await
            .into_iter()
            .find(|p| p.key == key)
            .map_or(0.0, |p| p.interruption_rate)
    }

    /// Price samples for the primary's family plus `extra`. Empty when
    /// pricing is unavailable; audit records then carry zero prices.
    async fn prices(&self, primary: &Instance, extra: &[PoolKey]) -> Vec<PoolPrice> {
        let executor = self.manager.executor();
        match executor
            .get_pricing_snapshot(&primary.instance_type, &primary.region, extra)
            .await
        {
            Ok(snapshot) => snapshot.pools,
            Err(e) => {
                warn!(instance = %primary.id, error = %e, "pricing unavailable for audit record");
                Vec::new()
            }
        }
    }

    fn close(
        &self,
        event: InterruptionEvent,
        switch_event: Option<SwitchEvent>,
        new_primary: Option<InstanceId>,
    ) -> ReplicaResult<FailoverReport> {
        let store = self.manager.store();
        if let Some(switch) = &switch_event {
            store.append_switch_event(switch)?;
        }
        store.append_interruption_event(&event)?;
        info!(
            workload = %event.workload_id,
            signal = %event.signal_type,
            action = ?event.response_action,
            success = event.success,
            reason = %event.reason,
            "interruption handled"
        );
        Ok(FailoverReport {
            event,
            switch_event,
            new_primary,
        })
    }
}

fn spot_price(prices: &[PoolPrice], key: &PoolKey) -> Option<f64> {
    prices.iter().find(|p| &p.key == key).map(|p| p.spot_price)
}

fn interruption_event(
    signal: &InterruptionSignal,
    response_action: ResponseAction,
    replica_id: Option<String>,
    success: bool,
    reason: String,
) -> InterruptionEvent {
    InterruptionEvent {
        id: next_record_id("int"),
        workload_id: signal.workload_id.clone(),
        instance_id: signal.instance_id.clone(),
        signal_type: signal.kind,
        detected_at: signal.detected_at,
        deadline: signal.deadline,
        response_action,
        replica_id,
        success,
        reason,
        probability: None,
    }
}

fn preempted_event(signal: &InterruptionSignal) -> InterruptionEvent {
    interruption_event(
        signal,
        ResponseAction::Preempted,
        None,
        false,
        "preempted by termination notice".to_string(),
    )
}
