//! The one place decision actions reach the executor.
//!
//! Dry-run is checked here and nowhere else. A switch launches the target,
//! waits for it to run, demotes and terminates the old primary, and only
//! then registers the new primary in the arena.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use spotwarden_core::{
    ActionType, Clock, Decision, Instance, InstanceRole, InstanceStatus, Lifecycle, PoolKey,
    PricingSnapshot, SwitchEvent, SwitchTrigger, next_record_id,
};
use spotwarden_provider::{Executor, LaunchSpec, RetryPolicy};
use spotwarden_safety::Lease;
use spotwarden_state::StateStore;

use crate::error::CycleResult;

/// What happened when a decision was handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// STAY, nothing to execute.
    Nothing,
    /// Transition computed and logged but not executed.
    DryRun,
    Switched(SwitchEvent),
    Failed(SwitchEvent),
    /// A termination notice took the workload mid-switch.
    Preempted(SwitchEvent),
}

impl DispatchOutcome {
    pub fn switch_event(&self) -> Option<&SwitchEvent> {
        match self {
            Self::Switched(e) | Self::Failed(e) | Self::Preempted(e) => Some(e),
            Self::Nothing | Self::DryRun => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: StateStore,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    dry_run: bool,
    launch_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: StateStore,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        dry_run: bool,
        launch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            retry,
            dry_run,
            launch_timeout,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn dispatch(
        &self,
        decision: &Decision,
        current: &Instance,
        pricing: &PricingSnapshot,
        lease: &Lease,
    ) -> CycleResult<DispatchOutcome> {
        let lifecycle = match decision.action {
            ActionType::Stay => return Ok(DispatchOutcome::Nothing),
            ActionType::SwitchToSpot => Lifecycle::Spot,
            ActionType::FallbackOndemand => Lifecycle::OnDemand,
        };
        if self.dry_run {
            info!(
                workload = %decision.workload_id,
                action = %decision.action,
                target = ?decision.target_pool,
                "dry run: transition not executed"
            );
            return Ok(DispatchOutcome::DryRun);
        }

        let quote = Quote::new(pricing, current, decision.target_pool.as_ref(), lifecycle);
        let Some(target) = decision.target_pool.clone() else {
            let event = quote.event(decision, current, None, "decision carried no target pool", false, self.clock.now());
            return Ok(DispatchOutcome::Failed(event));
        };
        let spec = LaunchSpec {
            workload_id: current.workload_id.clone(),
            instance_type: target.instance_type.clone(),
            region: target.region.clone(),
            az: target.az.clone(),
            lifecycle,
            role: InstanceRole::Primary,
        };
        let launched = tokio::select! {
            biased;
            _ = lease.cancelled() => None,
            launched = self.retry.run("launch_instance", || self.executor.launch_instance(&spec)) => Some(launched),
        };
        let new_id = match launched {
            None => {
                let reason = format!("preempted by termination notice before launch in {target}");
                let event = quote.event(decision, current, None, &reason, false, self.clock.now());
                return Ok(DispatchOutcome::Preempted(event));
            }
            Some(Ok(id)) => id,
            Some(Err(e)) => {
                warn!(workload = %decision.workload_id, target = %target, error = %e, "switch launch failed");
                let reason = format!("launch in {target} failed: {e}");
                let event = quote.event(decision, current, None, &reason, false, self.clock.now());
                return Ok(DispatchOutcome::Failed(event));
            }
        };

        let waited = tokio::select! {
            biased;
            _ = lease.cancelled() => None,
            running = self.executor.wait_for_instance_state(&new_id, InstanceStatus::Running, self.launch_timeout) => Some(running),
        };
        let running = match waited {
            None => {
                self.terminate_best_effort(&new_id).await;
                let reason = format!("preempted by termination notice; {new_id} terminated");
                let event = quote.event(decision, current, Some(&new_id), &reason, false, self.clock.now());
                return Ok(DispatchOutcome::Preempted(event));
            }
            Some(Ok(running)) => running,
            Some(Err(e)) => {
                warn!(instance = %new_id, error = %e, "wait for running failed");
                false
            }
        };
        if !running {
            self.terminate_best_effort(&new_id).await;
            let reason = format!(
                "{new_id} not running within {}s; terminated",
                self.launch_timeout.as_secs()
            );
            let event = quote.event(decision, current, Some(&new_id), &reason, false, self.clock.now());
            return Ok(DispatchOutcome::Failed(event));
        }

        // Demote before registering so the arena never holds two primaries.
        let now = self.clock.now();
        let mut old = current.clone();
        old.role = InstanceRole::Zombie;
        self.store.put_instance(&old)?;
        self.store.put_instance(&Instance {
            id: new_id.clone(),
            workload_id: current.workload_id.clone(),
            instance_type: target.instance_type.clone(),
            region: target.region.clone(),
            az: target.az.clone(),
            lifecycle,
            role: InstanceRole::Primary,
            status: InstanceStatus::Running,
            created_at: now,
            terminated_at: None,
        })?;
        if self.terminate_best_effort(&old.id).await {
            old.mark_terminated(self.clock.now());
            self.store.put_instance(&old)?;
        }

        info!(
            workload = %decision.workload_id,
            old = %current.id,
            new = %new_id,
            action = %decision.action,
            "switch completed"
        );
        let event = quote.event(decision, current, Some(&new_id), &decision.reason, true, self.clock.now());
        Ok(DispatchOutcome::Switched(event))
    }

    async fn terminate_best_effort(&self, id: &str) -> bool {
        match self.executor.terminate_instance(id).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(instance = %id, "provider refused termination");
                false
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "terminate failed");
                false
            }
        }
    }
}

/// Hourly prices of the old and new placement.
struct Quote {
    old_price: f64,
    new_price: Option<f64>,
}

impl Quote {
    fn new(
        pricing: &PricingSnapshot,
        current: &Instance,
        target: Option<&PoolKey>,
        lifecycle: Lifecycle,
    ) -> Self {
        let old_price = pricing
            .get(&current.pool_key())
            .map(|p| match current.lifecycle {
                Lifecycle::Spot => p.spot_price,
                Lifecycle::OnDemand => p.on_demand_price,
            })
            .unwrap_or(0.0);
        let new_price = target.and_then(|key| pricing.get(key)).map(|p| match lifecycle {
            Lifecycle::Spot => p.spot_price,
            Lifecycle::OnDemand => p.on_demand_price,
        });
        Self { old_price, new_price }
    }

    fn event(
        &self,
        decision: &Decision,
        current: &Instance,
        new_instance_id: Option<&str>,
        reason: &str,
        success: bool,
        recorded_at: u64,
    ) -> SwitchEvent {
        let new_price = if success { self.new_price } else { None };
        SwitchEvent {
            id: next_record_id("sw"),
            workload_id: decision.workload_id.clone(),
            old_instance_id: current.id.clone(),
            new_instance_id: new_instance_id.map(str::to_string),
            trigger: SwitchTrigger::Decision,
            reason: reason.to_string(),
            old_price: self.old_price,
            new_price,
            savings_per_hour: new_price.map_or(0.0, |p| self.old_price - p),
            // Launch-then-cutover keeps the old primary serving throughout.
            downtime_seconds: 0.0,
            success,
            recorded_at,
        }
    }
}
