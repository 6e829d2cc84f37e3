//! One decision cycle for one workload.
//!
//! ```text
//! lease ─▶ gate (review, cooldown) ─▶ collect ─▶ forecast ─▶ decide
//!       ─▶ breaker ─▶ dispatch ─▶ audit ─▶ cooldown / breaker update
//! ```
//!
//! Every path that gets past the lease appends exactly one `Decision`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use spotwarden_core::{
    ActionType, Clock, Decision, DecisionMetadata, EngineConfig, Instance, PricingSnapshot,
    SwitchEvent, UsageSample, next_record_id,
};
use spotwarden_engine::{DecisionInput, Predictions, decide, forecast_targets};
use spotwarden_provider::{Executor, PriceOracle, ProviderError, RetryPolicy};
use spotwarden_replica::ReplicaManager;
use spotwarden_safety::{LeaseKind, SafetyLayer};
use spotwarden_state::StateStore;

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{CycleError, CycleResult};

/// Gate name recorded when the breaker suppresses a transition.
pub const BREAKER_GATE: &str = "circuit_breaker";
/// Gate name recorded when a termination notice took the workload first.
pub const PREEMPTED_GATE: &str = "preempted";

/// Everything one cycle produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub decision: Decision,
    pub switch_event: Option<SwitchEvent>,
}

#[derive(Clone)]
pub struct DecisionCycle {
    store: StateStore,
    executor: Arc<dyn Executor>,
    oracle: Arc<dyn PriceOracle>,
    clock: Arc<dyn Clock>,
    safety: SafetyLayer,
    replicas: ReplicaManager,
    dispatcher: Dispatcher,
    retry: RetryPolicy,
    config: EngineConfig,
}

impl DecisionCycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StateStore,
        executor: Arc<dyn Executor>,
        oracle: Arc<dyn PriceOracle>,
        clock: Arc<dyn Clock>,
        safety: SafetyLayer,
        replicas: ReplicaManager,
        dispatcher: Dispatcher,
        retry: RetryPolicy,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executor,
            oracle,
            clock,
            safety,
            replicas,
            dispatcher,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one cycle. Fails with `Busy` if another cycle or signal handler
    /// holds the workload.
    pub async fn run_once(&self, workload_id: &str) -> CycleResult<CycleOutcome> {
        let lease = self
            .safety
            .leases()
            .try_acquire(workload_id, LeaseKind::DecisionCycle)?;
        let primary = self
            .store
            .live_primary(workload_id)?
            .ok_or_else(|| CycleError::NoPrimary(workload_id.to_string()))?;
        let now = self.clock.now();
        debug!(workload = %workload_id, instance = %primary.id, "decision cycle started");

        if let Some(gate) = self.safety.pre_engine_gate(workload_id, now)? {
            let decision = self.stay(&primary, now, gate.reason(), Some(gate.name()), true);
            return self.record(decision, None);
        }

        // Provider and oracle calls give way to a termination notice.
        let collected = tokio::select! {
            biased;
            _ = lease.cancelled() => None,
            collected = self.collect(&primary) => Some(collected),
        };
        let (usage, pricing) = match collected {
            None => return self.record(self.preempted(&primary, now), None),
            Some(Ok(collected)) => collected,
            Some(Err(e)) if e.is_fatal() => {
                let reason = format!("executor failure: {e}; flagged for manual review");
                self.safety.flag_manual_review(workload_id, &e.to_string(), now)?;
                let decision = self.stay(&primary, now, reason, None, false);
                return self.record(decision, None);
            }
            Some(Err(e)) => {
                let reason = format!("executor failure after retries: {e}; no action taken");
                let decision = self.stay(&primary, now, reason, None, false);
                return self.record(decision, None);
            }
        };

        let input = DecisionInput {
            instance: primary.clone(),
            usage,
            pricing,
            now,
        };
        let predictions = tokio::select! {
            biased;
            _ = lease.cancelled() => None,
            predictions = self.forecast(&input) => Some(predictions),
        };
        let Some(predictions) = predictions else {
            return self.record(self.preempted(&primary, now), None);
        };
        let mut decision = decide(&self.config, &input, &predictions);

        if decision.action.is_transition() && !self.safety.transitions_allowed(workload_id)? {
            warn!(workload = %workload_id, action = %decision.action, "circuit breaker open, transition suppressed");
            suppress(&mut decision, BREAKER_GATE, "circuit breaker open");
        }
        if decision.action.is_transition() && lease.is_cancelled() {
            suppress(&mut decision, PREEMPTED_GATE, "preempted by termination notice");
            decision.success = false;
        }

        let outcome = self
            .dispatcher
            .dispatch(&decision, &primary, &input.pricing, &lease)
            .await?;
        self.settle(decision, outcome).await
    }

    /// Fetch live state, usage, and prices with retry.
    async fn collect(&self, primary: &Instance) -> Result<(UsageSample, PricingSnapshot), ProviderError> {
        let described = self
            .retry
            .run("get_instance_state", || self.executor.get_instance_state(&primary.id))
            .await?;
        if described.status != primary.status {
            debug!(instance = %primary.id, arena = %primary.status, provider = %described.status, "instance status drifted");
        }
        let window = self.config.usage_window();
        let usage = self
            .retry
            .run("get_usage_metrics", || self.executor.get_usage_metrics(&primary.id, window))
            .await?;
        let pricing = self
            .retry
            .run("get_pricing_snapshot", || {
                self.executor
                    .get_pricing_snapshot(&primary.instance_type, &primary.region, &[])
            })
            .await?;
        Ok((usage, pricing))
    }

    /// Ask the oracle about every pool the engine will look at. Missing
    /// entries make the engine fall back to recent prices.
    async fn forecast(&self, input: &DecisionInput) -> Predictions {
        let mut predictions = Predictions::new();
        for pool in forecast_targets(&self.config, input) {
            let predicted = self
                .oracle
                .predict(&pool.key, input.now, &pool.recent_prices)
                .await;
            match predicted {
                Ok(forecast) => {
                    predictions.insert(pool.key, forecast);
                }
                Err(e) => debug!(pool = %pool.key, error = %e, "forecast unavailable"),
            }
        }
        predictions
    }

    /// Fold the dispatch result into the decision, append the audit rows
    /// and update cooldown and breaker state.
    async fn settle(
        &self,
        mut decision: Decision,
        outcome: DispatchOutcome,
    ) -> CycleResult<CycleOutcome> {
        let workload_id = decision.workload_id.clone();
        let now = self.clock.now();
        let switch_event = outcome.switch_event().cloned();

        match &outcome {
            DispatchOutcome::Nothing => {}
            DispatchOutcome::DryRun => {
                self.safety
                    .record_transition(&workload_id, decision.cooldown_until, true, now)?;
            }
            DispatchOutcome::Switched(_) => {
                self.safety
                    .record_transition(&workload_id, decision.cooldown_until, true, now)?;
                // Replicas of the superseded primary have nothing left to protect.
                self.replicas
                    .terminate_all(&workload_id, "parent superseded by switch")
                    .await?;
            }
            DispatchOutcome::Failed(event) => {
                decision.success = false;
                decision.reason = format!("{}; switch failed: {}", decision.reason, event.reason);
                self.safety
                    .record_transition(&workload_id, decision.cooldown_until, false, now)?;
            }
            DispatchOutcome::Preempted(event) => {
                decision.success = false;
                decision.reason = format!("{}; {}", decision.reason, event.reason);
                decision.metadata.gate = Some(PREEMPTED_GATE.to_string());
            }
        }
        self.record(decision, switch_event)
    }

    fn record(&self, decision: Decision, switch_event: Option<SwitchEvent>) -> CycleResult<CycleOutcome> {
        self.store.append_decision(&decision)?;
        if let Some(event) = &switch_event {
            self.store.append_switch_event(event)?;
        }
        info!(
            workload = %decision.workload_id,
            action = %decision.action,
            success = decision.success,
            dry_run = decision.dry_run,
            reason = %decision.reason,
            "decision recorded"
        );
        Ok(CycleOutcome {
            decision,
            switch_event,
        })
    }

    fn stay(
        &self,
        primary: &Instance,
        now: u64,
        reason: String,
        gate: Option<&str>,
        success: bool,
    ) -> Decision {
        Decision {
            id: next_record_id("dec"),
            workload_id: primary.workload_id.clone(),
            instance_id: primary.id.clone(),
            action: ActionType::Stay,
            target_pool: None,
            target_instance_type: None,
            reason,
            cooldown_until: None,
            decided_at: now,
            dry_run: self.config.dry_run_mode,
            success,
            metadata: DecisionMetadata {
                config: self.config.clone(),
                effective_discount_margin: self.config.discount_margin,
                gate: gate.map(str::to_string),
                ..Default::default()
            },
        }
    }

    fn preempted(&self, primary: &Instance, now: u64) -> Decision {
        self.stay(
            primary,
            now,
            "preempted by termination notice".to_string(),
            Some(PREEMPTED_GATE),
            false,
        )
    }
}

/// Turn a transition into STAY, keeping what the engine wanted.
fn suppress(decision: &mut Decision, gate: &str, why: &str) {
    decision.metadata.suppressed_action = Some(decision.action);
    decision.metadata.gate = Some(gate.to_string());
    decision.reason = format!("{why}; {} suppressed ({})", decision.action, decision.reason);
    decision.action = ActionType::Stay;
    decision.target_pool = None;
    decision.target_instance_type = None;
    decision.cooldown_until = None;
}
