//! Safety layer: persisted cooldown, breaker and manual-review state.
//!
//! Every change to a control record is applied inside one store write
//! transaction, so a cycle's transition and an operator's reset cannot
//! overwrite each other.

use std::sync::Arc;

use tracing::{info, warn};

use spotwarden_core::SafetyConfig;
use spotwarden_state::{StateResult, StateStore, WorkloadControl};

use crate::alert::{Alert, AlertKind, AlertSink};
use crate::breaker::{BreakerOutcome, CircuitBreaker};
use crate::cooldown;
use crate::lease::LeaseTable;

/// A gate that short-circuits a cycle before the engine runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    ManualReview(String),
    Cooldown { until: u64 },
}

impl Gate {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ManualReview(_) => "manual_review",
            Self::Cooldown { .. } => "cooldown",
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Self::ManualReview(why) => format!("workload flagged for manual review: {why}"),
            Self::Cooldown { until } => format!("cooldown active until {until}"),
        }
    }
}

#[derive(Clone)]
pub struct SafetyLayer {
    store: StateStore,
    breaker: CircuitBreaker,
    alerts: Arc<dyn AlertSink>,
    leases: LeaseTable,
}

impl SafetyLayer {
    pub fn new(store: StateStore, config: &SafetyConfig, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::new(config.breaker_failure_threshold),
            alerts,
            leases: LeaseTable::new(),
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn breaker(&self) -> CircuitBreaker {
        self.breaker
    }

    /// Current control record, or a fresh one.
    pub fn control(&self, workload_id: &str) -> StateResult<WorkloadControl> {
        Ok(self
            .store
            .get_control(workload_id)?
            .unwrap_or_else(|| WorkloadControl::new(workload_id)))
    }

    /// Manual review first, then cooldown.
    pub fn pre_engine_gate(&self, workload_id: &str, now: u64) -> StateResult<Option<Gate>> {
        let control = self.control(workload_id)?;
        if let Some(why) = control.manual_review {
            return Ok(Some(Gate::ManualReview(why)));
        }
        Ok(cooldown::active_until(&control, now).map(|until| Gate::Cooldown { until }))
    }

    pub fn transitions_allowed(&self, workload_id: &str) -> StateResult<bool> {
        Ok(self.breaker.allows_transition(&self.control(workload_id)?))
    }

    /// Record the outcome of a dispatched decision transition. `cooldown_until`
    /// is applied either way; the breaker only counts real attempts.
    pub fn record_transition(
        &self,
        workload_id: &str,
        cooldown_until: Option<u64>,
        success: bool,
        now: u64,
    ) -> StateResult<BreakerOutcome> {
        let breaker = self.breaker;
        let (control, outcome) = self.store.update_control(workload_id, |control| {
            if let Some(until) = cooldown_until {
                cooldown::extend(control, until);
            }
            control.updated_at = now;
            if success {
                breaker.record_success(control);
                BreakerOutcome::Counted(control.consecutive_failures)
            } else {
                breaker.record_failure(control, now)
            }
        })?;

        if outcome == BreakerOutcome::Opened {
            self.alerts.raise(Alert {
                workload_id: workload_id.to_string(),
                kind: AlertKind::BreakerOpened,
                message: format!(
                    "auto-switching disabled after {} consecutive failed switches",
                    control.consecutive_failures
                ),
                raised_at: now,
            });
        }
        Ok(outcome)
    }

    pub fn flag_manual_review(&self, workload_id: &str, reason: &str, now: u64) -> StateResult<()> {
        self.store.update_control(workload_id, |control| {
            control.manual_review = Some(reason.to_string());
            control.updated_at = now;
        })?;
        warn!(workload = %workload_id, reason, "workload flagged for manual review");
        self.alerts.raise(Alert {
            workload_id: workload_id.to_string(),
            kind: AlertKind::ManualReview,
            message: reason.to_string(),
            raised_at: now,
        });
        Ok(())
    }

    pub fn raise(&self, workload_id: &str, kind: AlertKind, message: String, now: u64) {
        self.alerts.raise(Alert {
            workload_id: workload_id.to_string(),
            kind,
            message,
            raised_at: now,
        });
    }

    pub fn reset_breaker(&self, workload_id: &str, now: u64) -> StateResult<WorkloadControl> {
        let breaker = self.breaker;
        let (control, ()) = self.store.update_control(workload_id, |control| {
            breaker.manual_reset(control);
            control.updated_at = now;
        })?;
        Ok(control)
    }

    pub fn clear_review(&self, workload_id: &str, now: u64) -> StateResult<WorkloadControl> {
        let (control, cleared) = self.store.update_control(workload_id, |control| {
            control.updated_at = now;
            control.manual_review.take().is_some()
        })?;
        if cleared {
            info!(workload = %workload_id, "manual review cleared");
        }
        Ok(control)
    }
}
