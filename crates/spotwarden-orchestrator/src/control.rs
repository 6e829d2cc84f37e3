//! Control-plane loop: periodic decision cycles per workload plus
//! interruption signal routing.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use spotwarden_core::{ResponseAction, SignalKind};
use spotwarden_replica::{FailoverCoordinator, FailoverReport, InterruptionSignal, SignalSource};
use spotwarden_safety::{AlertKind, Lease, LeaseBusy, LeaseKind, SafetyLayer};

use crate::cycle::{CycleOutcome, DecisionCycle};
use crate::error::{CycleError, CycleResult};

/// How often a deferred rebalance handler retries the workload lease.
const LEASE_RETRY: Duration = Duration::from_millis(250);
/// Longest a termination notice waits for the lease holder to yield.
const PREEMPT_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ControlPlane {
    cycle: DecisionCycle,
    failover: FailoverCoordinator,
    safety: SafetyLayer,
    workloads: Vec<String>,
}

impl ControlPlane {
    pub fn new(
        cycle: DecisionCycle,
        failover: FailoverCoordinator,
        safety: SafetyLayer,
        workloads: Vec<String>,
    ) -> Self {
        Self {
            cycle,
            failover,
            safety,
            workloads,
        }
    }

    pub fn workloads(&self) -> &[String] {
        &self.workloads
    }

    /// One cycle for every workload, concurrently.
    pub async fn run_cycles(&self) -> Vec<(String, CycleResult<CycleOutcome>)> {
        let mut tasks = JoinSet::new();
        for workload in &self.workloads {
            let this = self.clone();
            let workload = workload.clone();
            tasks.spawn(async move {
                this.enforce_replica_mode(&workload).await;
                let result = this.cycle.run_once(&workload).await;
                (workload, result)
            });
        }

        let mut results = Vec::with_capacity(self.workloads.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((workload, result)) => {
                    if let Err(e) = &result {
                        match e {
                            CycleError::Busy(busy) => {
                                info!(workload = %workload, holder = %busy.holder, "cycle skipped, workload busy")
                            }
                            other => warn!(workload = %workload, error = %other, "decision cycle failed"),
                        }
                    }
                    results.push((workload, result));
                }
                Err(e) => error!(error = %e, "decision cycle task panicked"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// With both replica modes off, standing replicas are torn down.
    async fn enforce_replica_mode(&self, workload_id: &str) {
        let config = self.failover.manager().config();
        if config.manual_replicas_enabled || config.auto_defense_enabled {
            return;
        }
        match self
            .failover
            .manager()
            .terminate_all(workload_id, "replica mode disabled")
            .await
        {
            Ok(released) if !released.is_empty() => {
                info!(workload = %workload_id, count = released.len(), "replicas terminated, replica mode disabled")
            }
            Ok(_) => {}
            Err(e) => warn!(workload = %workload_id, error = %e, "terminating replicas failed"),
        }
    }

    /// Route one interruption signal.
    ///
    /// A termination notice preempts whatever holds the workload and runs
    /// immediately. A rebalance recommendation waits for the lease until its
    /// horizon passes. A signal that cannot be handled still closes with a
    /// failed interruption event.
    pub async fn handle_signal(&self, signal: &InterruptionSignal) -> CycleResult<FailoverReport> {
        match signal.kind {
            SignalKind::TerminationNotice => {
                let _lease = self
                    .safety
                    .leases()
                    .preempt(&signal.workload_id, LeaseKind::Failover, self.preempt_grace(signal))
                    .await;
                let report = self.failover.handle_termination_notice(signal).await?;
                if report.event.response_action == ResponseAction::EmergencySnapshot {
                    self.safety.raise(
                        &signal.workload_id,
                        AlertKind::FailoverDegraded,
                        report.event.reason.clone(),
                        report.event.detected_at,
                    );
                }
                Ok(report)
            }
            SignalKind::RebalanceRecommendation => {
                let lease = match self.acquire_deferred(signal).await {
                    Ok(lease) => lease,
                    Err(busy) => {
                        self.failover.record_unhandled(signal, &busy.to_string());
                        return Err(busy.into());
                    }
                };
                Ok(self.failover.handle_rebalance(signal, &lease).await?)
            }
        }
    }

    /// Half the slack left before the final-delta window, capped. Past it
    /// the notice takes the lease whether or not the holder has yielded.
    fn preempt_grace(&self, signal: &InterruptionSignal) -> Duration {
        let manager = self.failover.manager();
        let config = manager.config();
        let reserve = config.promotion_timeout_secs + config.drain_margin_secs;
        let slack = signal
            .deadline
            .saturating_sub(manager.clock().now())
            .saturating_sub(reserve);
        PREEMPT_GRACE.min(Duration::from_secs(slack / 2))
    }

    async fn acquire_deferred(&self, signal: &InterruptionSignal) -> Result<Lease, LeaseBusy> {
        let horizon = Duration::from_secs(signal.deadline.saturating_sub(signal.detected_at));
        let started = tokio::time::Instant::now();
        loop {
            match self
                .safety
                .leases()
                .try_acquire(&signal.workload_id, LeaseKind::Rebalance)
            {
                Ok(lease) => return Ok(lease),
                Err(busy) if started.elapsed() >= horizon => return Err(busy),
                Err(_) => tokio::time::sleep(LEASE_RETRY).await,
            }
        }
    }

    /// Periodic decision cycles until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            workloads = self.workloads.len(),
            "control plane started"
        );
        loop {
            self.run_cycles().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("control plane shutting down");
                    break;
                }
            }
        }
    }

    /// Consume signals until the source is exhausted or shutdown. Each
    /// signal is handled on its own task so a termination notice can
    /// preempt a rebalance still in flight.
    pub async fn run_signals(&self, mut source: Box<dyn SignalSource>, mut shutdown: watch::Receiver<bool>) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                next = source.next_signal() => {
                    let Some(signal) = next else {
                        info!("signal source exhausted");
                        break;
                    };
                    let this = self.clone();
                    handlers.spawn(async move {
                        if let Err(e) = this.handle_signal(&signal).await {
                            error!(
                                workload = %signal.workload_id,
                                signal = %signal.kind,
                                error = %e,
                                "interruption handling failed"
                            );
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("signal router shutting down");
                    break;
                }
            }
        }
        while handlers.join_next().await.is_some() {}
    }
}
