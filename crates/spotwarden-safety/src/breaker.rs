//! Per-workload circuit breaker for decision-driven switches.
//!
//! ```text
//! closed ──(N consecutive failures)──► open ──(manual reset)──► closed
//!    ▲                                  │
//!    └──────────(success)───────────────┘  (only while closed)
//! ```
//!
//! There is no half-open state: once open, only an operator closes it.

use tracing::{info, warn};

use spotwarden_state::WorkloadControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    /// Failure counted, breaker still closed.
    Counted(u32),
    /// This failure opened the breaker.
    Opened,
    /// Breaker was already open.
    AlreadyOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreaker {
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn allows_transition(&self, control: &WorkloadControl) -> bool {
        !control.breaker_open
    }

    pub fn record_success(&self, control: &mut WorkloadControl) {
        if !control.breaker_open {
            control.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&self, control: &mut WorkloadControl, now: u64) -> BreakerOutcome {
        if control.breaker_open {
            return BreakerOutcome::AlreadyOpen;
        }
        control.consecutive_failures += 1;
        if control.consecutive_failures >= self.threshold {
            control.breaker_open = true;
            control.breaker_opened_at = Some(now);
            warn!(
                workload = %control.workload_id,
                failures = control.consecutive_failures,
                "circuit breaker opened"
            );
            BreakerOutcome::Opened
        } else {
            BreakerOutcome::Counted(control.consecutive_failures)
        }
    }

    pub fn manual_reset(&self, control: &mut WorkloadControl) {
        control.breaker_open = false;
        control.breaker_opened_at = None;
        control.consecutive_failures = 0;
        info!(workload = %control.workload_id, "circuit breaker reset");
    }
}
