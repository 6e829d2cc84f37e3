//! Interruption handling against the simulated provider.

use std::sync::Arc;
use std::time::Duration;

use spotwarden_core::{
    Instance, InstanceId, InstanceRole, InstanceShape, InstanceStatus, Lifecycle, ManualClock,
    PoolKey, PoolPrice, PricingSnapshot, ReplicaConfig, ReplicaOrigin, ReplicaStatus,
    ResponseAction, SyncStatus, SwitchTrigger, Urgency, UsageSample,
};
use spotwarden_provider::sim::{RecordingAgent, SimExecutor, SimWorld};
use spotwarden_provider::{Executor, InstanceDescription, LaunchSpec, ProviderFuture, RetryPolicy};
use spotwarden_replica::{
    FailoverCoordinator, InterruptionSignal, ProgressReport, ReplicaError, ReplicaManager,
};
use spotwarden_safety::{LeaseKind, LeaseTable};
use spotwarden_state::StateStore;

// 2023-11-14T22:13:20Z, outside the default 13-22 UTC peak window.
const NOW: u64 = 1_700_000_000;

struct Harness {
    coordinator: FailoverCoordinator,
    sim: Arc<SimExecutor>,
    agent: Arc<RecordingAgent>,
    store: StateStore,
}

impl Harness {
    fn manager(&self) -> &ReplicaManager {
        self.coordinator.manager()
    }

    async fn ready_replica(&self) -> String {
        let replica = self
            .manager()
            .create("i-primary", None, ReplicaOrigin::Manual, Urgency::Normal)
            .await
            .unwrap();
        self.manager()
            .report_progress(
                &replica.id,
                &ProgressReport {
                    sync_status: SyncStatus::Synced,
                    transfer_progress: 100,
                    sync_latency_ms: 12,
                },
            )
            .unwrap();
        replica.id
    }
}

fn pool(az: &str, spot: f64, interruption_rate: f64) -> PoolPrice {
    PoolPrice {
        key: PoolKey::new("us-east-1", az, "m5.large"),
        shape: InstanceShape {
            vcpus: 2,
            memory_mib: 8192,
        },
        spot_price: spot,
        on_demand_price: 0.096,
        observed_at: NOW,
        recent_prices: vec![spot],
        interruption_rate,
    }
}

fn harness_with(config: ReplicaConfig, primary_age_secs: u64, rate: f64) -> Harness {
    let clock = Arc::new(ManualClock::new(NOW));
    let world = SimWorld {
        instances: vec![InstanceDescription {
            id: "i-primary".to_string(),
            instance_type: "m5.large".to_string(),
            region: "us-east-1".to_string(),
            az: "us-east-1a".to_string(),
            lifecycle: Lifecycle::Spot,
            status: InstanceStatus::Running,
            launched_at: NOW - primary_age_secs,
        }],
        pools: vec![pool("us-east-1a", 0.030, rate), pool("us-east-1b", 0.028, rate)],
        ..Default::default()
    };
    let sim = Arc::new(SimExecutor::new(world, clock.clone()));
    let agent = Arc::new(RecordingAgent::new());
    let store = StateStore::open_in_memory().unwrap();
    store
        .put_instance(&Instance {
            id: "i-primary".to_string(),
            workload_id: "web".to_string(),
            instance_type: "m5.large".to_string(),
            region: "us-east-1".to_string(),
            az: "us-east-1a".to_string(),
            lifecycle: Lifecycle::Spot,
            role: InstanceRole::Primary,
            status: InstanceStatus::Running,
            created_at: NOW - primary_age_secs,
            terminated_at: None,
        })
        .unwrap();
    let manager = ReplicaManager::new(
        store.clone(),
        sim.clone(),
        clock,
        config,
        RetryPolicy::no_retry(),
    );
    Harness {
        coordinator: FailoverCoordinator::new(manager, agent.clone()),
        sim,
        agent,
        store,
    }
}

fn harness() -> Harness {
    harness_with(ReplicaConfig::default(), 3600, 0.05)
}

/// Hands control back to the scheduler before every pricing call, so two
/// creates for one parent interleave between their slot check and insert.
struct YieldingExecutor(Arc<SimExecutor>);

impl Executor for YieldingExecutor {
    fn get_instance_state<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, InstanceDescription> {
        self.0.get_instance_state(id)
    }

    fn get_usage_metrics<'a>(&'a self, id: &'a str, window: Duration) -> ProviderFuture<'a, UsageSample> {
        self.0.get_usage_metrics(id, window)
    }

    fn get_pricing_snapshot<'a>(
        &'a self,
        instance_type: &'a str,
        region: &'a str,
        pools: &'a [PoolKey],
    ) -> ProviderFuture<'a, PricingSnapshot> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.get_pricing_snapshot(instance_type, region, pools).await
        })
    }

    fn launch_instance<'a>(&'a self, spec: &'a LaunchSpec) -> ProviderFuture<'a, InstanceId> {
        self.0.launch_instance(spec)
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, bool> {
        self.0.terminate_instance(id)
    }

    fn wait_for_instance_state<'a>(
        &'a self,
        id: &'a str,
        state: InstanceStatus,
        timeout: Duration,
    ) -> ProviderFuture<'a, bool> {
        self.0.wait_for_instance_state(id, state, timeout)
    }
}

/// Same store and sim as `h`, with every pricing call yielding first.
fn yielding_coordinator(h: &Harness) -> FailoverCoordinator {
    let manager = ReplicaManager::new(
        h.store.clone(),
        Arc::new(YieldingExecutor(h.sim.clone())),
        Arc::new(ManualClock::new(NOW)),
        ReplicaConfig::default(),
        RetryPolicy::no_retry(),
    );
    FailoverCoordinator::new(manager, h.agent.clone())
}

fn live_replicas(h: &Harness) -> Vec<spotwarden_core::Replica> {
    h.store
        .list_replicas_for_parent("i-primary")
        .unwrap()
        .into_iter()
        .filter(|r| !r.status.is_terminal())
        .collect()
}

fn notice() -> InterruptionSignal {
    InterruptionSignal::termination_notice("web", "i-primary", NOW, NOW + 120)
}

#[tokio::test]
async fn ready_replica_is_promoted_without_downtime() {
    let h = harness();
    let replica_id = h.ready_replica().await;

    let report = h.coordinator.handle_termination_notice(&notice()).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::ReplicaPromoted);
    assert!(report.event.success);
    assert_eq!(report.event.replica_id.as_deref(), Some(replica_id.as_str()));
    let switch = report.switch_event.unwrap();
    assert_eq!(switch.downtime_seconds, 0.0);
    assert_eq!(switch.trigger, SwitchTrigger::Interruption);
    assert!(switch.success);

    let replica = h.store.require_replica(&replica_id).unwrap();
    assert_eq!(replica.status, ReplicaStatus::Promoted);
    let primary = h.store.live_primary("web").unwrap().unwrap();
    assert_eq!(Some(primary.id.clone()), replica.instance_id);
    assert_eq!(report.new_primary, Some(primary.id));
    assert_eq!(
        h.store.require_instance("i-primary").unwrap().role,
        InstanceRole::Zombie
    );

    let calls = h.agent.calls();
    assert_eq!(calls[0], "halt:i-primary");
    assert!(calls.iter().any(|c| c.starts_with("delta:i-primary->")));
    assert_eq!(h.store.list_interruption_events("web").unwrap().len(), 1);
    assert_eq!(h.store.list_switch_events("web").unwrap().len(), 1);
}

#[tokio::test]
async fn no_ready_replica_takes_degraded_path_with_downtime() {
    let h = harness();

    let report = h.coordinator.handle_termination_notice(&notice()).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::EmergencySnapshot);
    assert!(report.event.replica_id.is_none());
    assert!(report.event.success);
    let switch = report.switch_event.unwrap();
    assert!(switch.downtime_seconds > 0.0);
    assert!(h.agent.calls().contains(&"snapshot:i-primary".to_string()));
    assert!(h.sim.calls().contains(&"launch:m5.large:us-east-1a:OnDemand".to_string()));

    let primary = h.store.live_primary("web").unwrap().unwrap();
    assert_eq!(primary.lifecycle, Lifecycle::OnDemand);
    assert_eq!(report.new_primary, Some(primary.id));
}

#[tokio::test]
async fn degraded_path_reports_real_outcome() {
    let h = harness();
    h.agent.set_fail_snapshot(true);
    h.sim.set_faults(|f| f.launch_fatal = true);

    let report = h.coordinator.handle_termination_notice(&notice()).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::EmergencySnapshot);
    assert!(!report.event.success);
    let switch = report.switch_event.unwrap();
    assert!(!switch.success);
    assert!(switch.downtime_seconds > 0.0);
    assert!(switch.new_instance_id.is_none());
    assert!(report.event.reason.contains("snapshot failed"));
}

#[tokio::test]
async fn syncing_replica_is_not_promoted() {
    let h = harness();
    let replica = h
        .manager()
        .create("i-primary", None, ReplicaOrigin::Manual, Urgency::Normal)
        .await
        .unwrap();
    h.manager()
        .report_progress(
            &replica.id,
            &ProgressReport {
                sync_status: SyncStatus::Syncing,
                transfer_progress: 60,
                sync_latency_ms: 40,
            },
        )
        .unwrap();

    let report = h.coordinator.handle_termination_notice(&notice()).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::EmergencySnapshot);
    assert!(report.switch_event.unwrap().downtime_seconds > 0.0);
    // The half-synced replica is cleaned up rather than left dangling.
    assert_eq!(
        h.store.require_replica(&replica.id).unwrap().status,
        ReplicaStatus::Terminated
    );
}

#[tokio::test]
async fn promotion_timeout_escalates_to_degraded_path() {
    let h = harness();
    let replica_id = h.ready_replica().await;
    let backing = h
        .store
        .require_replica(&replica_id)
        .unwrap()
        .instance_id
        .unwrap();
    h.sim.set_status(&backing, InstanceStatus::Stopped);

    let report = h.coordinator.handle_termination_notice(&notice()).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::EmergencySnapshot);
    assert!(report.switch_event.unwrap().downtime_seconds > 0.0);
    assert_eq!(
        h.store.require_replica(&replica_id).unwrap().status,
        ReplicaStatus::Failed
    );
    assert!(h.sim.calls().contains(&format!("terminate:{backing}")));

    // Exactly one live primary, and it is the on-demand replacement.
    let primaries: Vec<_> = h
        .store
        .list_instances_for_workload("web")
        .unwrap()
        .into_iter()
        .filter(Instance::is_live_primary)
        .collect();
    assert_eq!(primaries.len(), 1);
    assert_eq!(primaries[0].lifecycle, Lifecycle::OnDemand);
}

#[tokio::test]
async fn failed_delta_transfer_falls_back() {
    let h = harness();
    let replica_id = h.ready_replica().await;
    h.agent.set_fail_transfer(true);

    let report = h.coordinator.handle_termination_notice(&notice()).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::EmergencySnapshot);
    assert_eq!(
        h.store.require_replica(&replica_id).unwrap().status,
        ReplicaStatus::Failed
    );
}

#[tokio::test]
async fn late_notice_skips_transfer() {
    let h = harness();
    let replica_id = h.ready_replica().await;
    // Deadline closer than promotion timeout plus drain margin.
    let signal = InterruptionSignal::termination_notice("web", "i-primary", NOW, NOW + 60);

    let report = h.coordinator.handle_termination_notice(&signal).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::EmergencySnapshot);
    assert!(!h.agent.calls().iter().any(|c| c.starts_with("delta:")));
    assert_eq!(
        h.store.require_replica(&replica_id).unwrap().status,
        ReplicaStatus::Failed
    );
}

#[tokio::test]
async fn at_most_one_replica_promoted() {
    let h = harness();
    let first = h.ready_replica().await;
    // Another ready replica for the same parent, created later.
    let mut second = h.store.require_replica(&first).unwrap();
    second.id = format!("{first}-b");
    second.created_at += 10;
    second.instance_id = None;
    h.store.put_replica(&second).unwrap();

    let report = h.coordinator.handle_termination_notice(&notice()).await;
    // The newer replica has no backing instance, so promotion of it fails
    // and the handler falls back.
    let report = report.unwrap();
    let promoted = h
        .store
        .list_replicas_for_workload("web")
        .unwrap()
        .into_iter()
        .filter(|r| r.status == ReplicaStatus::Promoted)
        .count();
    assert!(promoted <= 1);
    assert_eq!(h.store.list_interruption_events("web").unwrap().len(), 1);
    assert_eq!(report.event.response_action, ResponseAction::EmergencySnapshot);
}

#[tokio::test]
async fn sibling_replicas_terminated_after_promotion() {
    let h = harness();
    let older = h.ready_replica().await;
    // A second ready replica launched later wins the promotion.
    let mut newer = h.store.require_replica(&older).unwrap();
    newer.id = format!("{older}-newer");
    newer.created_at += 30;
    let backing = newer.instance_id.clone().unwrap();
    h.store.put_replica(&newer).unwrap();
    let mut old_record = h.store.require_replica(&older).unwrap();
    old_record.instance_id = None;
    h.store.put_replica(&old_record).unwrap();

    let report = h.coordinator.handle_termination_notice(&notice()).await.unwrap();

    assert_eq!(report.event.replica_id.as_deref(), Some(newer.id.as_str()));
    assert_eq!(report.new_primary.as_deref(), Some(backing.as_str()));
    assert_eq!(
        h.store.require_replica(&older).unwrap().status,
        ReplicaStatus::Terminated
    );
}

#[tokio::test]
async fn rebalance_below_threshold_launches_nothing() {
    // One hour old, quiet pool, off-peak: 0.5*0.05 + 0.2*(1/24) + 0.3*0.3 < 0.35
    let h = harness();
    let lease = LeaseTable::new().try_acquire("web", LeaseKind::Rebalance).unwrap();
    let signal = InterruptionSignal::rebalance("web", "i-primary", NOW);

    let report = h.coordinator.handle_rebalance(&signal, &lease).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::NoReplicaNeeded);
    assert!(report.event.probability.unwrap() < 0.35);
    assert_eq!(h.sim.launch_count(), 0);
}

#[tokio::test]
async fn rebalance_above_threshold_creates_emergency_replica() {
    // Old instance in a volatile pool.
    let h = harness_with(ReplicaConfig::default(), 48 * 3600, 0.4);
    let lease = LeaseTable::new().try_acquire("web", LeaseKind::Rebalance).unwrap();
    let signal = InterruptionSignal::rebalance("web", "i-primary", NOW);

    let report = h.coordinator.handle_rebalance(&signal, &lease).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::EmergencyReplicaCreated);
    let replica_id = report.event.replica_id.unwrap();
    let replica = h.store.require_replica(&replica_id).unwrap();
    assert_eq!(replica.urgency, Urgency::High);
    assert_eq!(replica.created_by, ReplicaOrigin::Automatic);
    assert_eq!(replica.status, ReplicaStatus::Launching);
}

#[tokio::test]
async fn rebalance_adopts_existing_manual_replica() {
    let h = harness_with(ReplicaConfig::default(), 48 * 3600, 0.4);
    let manual = h
        .manager()
        .create("i-primary", None, ReplicaOrigin::Manual, Urgency::Normal)
        .await
        .unwrap();
    let lease = LeaseTable::new().try_acquire("web", LeaseKind::Rebalance).unwrap();
    let signal = InterruptionSignal::rebalance("web", "i-primary", NOW);

    let report = h.coordinator.handle_rebalance(&signal, &lease).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::EmergencyReplicaAdopted);
    assert_eq!(report.event.replica_id.as_deref(), Some(manual.id.as_str()));
    assert_eq!(h.sim.launch_count(), 1);
    assert_eq!(
        h.store.require_replica(&manual.id).unwrap().urgency,
        Urgency::High
    );
}

#[tokio::test]
async fn rebalance_creation_failure_is_recorded_not_fatal() {
    let h = harness_with(ReplicaConfig::default(), 48 * 3600, 0.4);
    h.sim.set_faults(|f| f.launch_fatal = true);
    let lease = LeaseTable::new().try_acquire("web", LeaseKind::Rebalance).unwrap();
    let signal = InterruptionSignal::rebalance("web", "i-primary", NOW);

    let report = h.coordinator.handle_rebalance(&signal, &lease).await.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::ReplicaCreationFailed);
    assert!(!report.event.success);
    assert_eq!(h.store.list_interruption_events("web").unwrap().len(), 1);
}

#[tokio::test]
async fn rebalance_respects_disabled_defense() {
    let config = ReplicaConfig {
        auto_defense_enabled: false,
        ..Default::default()
    };
    let h = harness_with(config, 48 * 3600, 0.4);
    let lease = LeaseTable::new().try_acquire("web", LeaseKind::Rebalance).unwrap();
    let signal = InterruptionSignal::rebalance("web", "i-primary", NOW);

    let report = h.coordinator.handle_rebalance(&signal, &lease).await.unwrap();
    assert_eq!(report.event.response_action, ResponseAction::DefenseDisabled);
    assert_eq!(h.sim.launch_count(), 0);

    // The hard path still runs.
    let report = h.coordinator.handle_termination_notice(&notice()).await.unwrap();
    assert_eq!(report.event.response_action, ResponseAction::EmergencySnapshot);
}

#[tokio::test]
async fn preempted_rebalance_records_preemption() {
    let h = harness_with(ReplicaConfig::default(), 48 * 3600, 0.4);
    let leases = LeaseTable::new();
    let lease = leases.try_acquire("web", LeaseKind::Rebalance).unwrap();

    let preemptor = leases.clone();
    let waiter = tokio::spawn(async move { preemptor.preempt("web", LeaseKind::Failover, Duration::from_secs(5)).await });
    tokio::time::timeout(Duration::from_secs(5), lease.cancelled())
        .await
        .unwrap();

    let signal = InterruptionSignal::rebalance("web", "i-primary", NOW);
    let report = h.coordinator.handle_rebalance(&signal, &lease).await.unwrap();
    assert_eq!(report.event.response_action, ResponseAction::Preempted);
    assert!(!report.event.success);
    assert_eq!(h.sim.launch_count(), 0);

    drop(lease);
    let failover = waiter.await.unwrap();
    assert_eq!(failover.kind(), LeaseKind::Failover);
}

#[tokio::test]
async fn notice_for_unknown_instance_is_recorded_as_unhandled() {
    let h = harness();
    let signal = InterruptionSignal::termination_notice("web", "i-nope", NOW, NOW + 120);
    let err = h.coordinator.handle_termination_notice(&signal).await.unwrap_err();
    assert!(matches!(err, ReplicaError::ParentNotPrimary(_)));

    let events = h.store.list_interruption_events("web").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].response_action, ResponseAction::Unhandled);
    assert_eq!(events[0].instance_id, "i-nope");
    assert!(!events[0].success);
    assert!(events[0].reason.contains("i-nope"));
    assert_eq!(h.sim.launch_count(), 0);
}

#[tokio::test]
async fn notice_for_superseded_primary_is_recorded_as_unhandled() {
    let h = harness();
    let mut old = h.store.require_instance("i-primary").unwrap();
    old.role = InstanceRole::Zombie;
    h.store.put_instance(&old).unwrap();

    assert!(h.coordinator.handle_termination_notice(&notice()).await.is_err());

    let events = h.store.list_interruption_events("web").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].response_action, ResponseAction::Unhandled);
    assert!(!events[0].success);
    assert!(h.agent.calls().is_empty());
}

#[tokio::test]
async fn concurrent_creates_leave_one_replica_per_parent() {
    let h = harness();
    let coordinator = yielding_coordinator(&h);
    let manager = coordinator.manager();

    let (manual, automatic) = tokio::join!(
        manager.create("i-primary", None, ReplicaOrigin::Manual, Urgency::Normal),
        manager.create("i-primary", None, ReplicaOrigin::Automatic, Urgency::High),
    );

    let (winner, loser) = match (manual, automatic) {
        (Ok(replica), Err(err)) | (Err(err), Ok(replica)) => (replica, err),
        (manual, automatic) => panic!("expected exactly one create to win: {manual:?} {automatic:?}"),
    };
    match loser {
        ReplicaError::SlotOccupied { existing, .. } => assert_eq!(existing, winner.id),
        other => panic!("unexpected error: {other}"),
    }
    let live = live_replicas(&h);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, winner.id);
    assert_eq!(h.sim.launch_count(), 1);
}

#[tokio::test]
async fn rebalance_racing_manual_create_adopts_the_manual_replica() {
    let h = harness_with(ReplicaConfig::default(), 48 * 3600, 0.4);
    let coordinator = yielding_coordinator(&h);
    let leases = LeaseTable::new();
    let lease = leases.try_acquire("web", LeaseKind::Rebalance).unwrap();
    let signal = InterruptionSignal::rebalance("web", "i-primary", NOW);

    let (manual, report) = tokio::join!(
        coordinator
            .manager()
            .create("i-primary", None, ReplicaOrigin::Manual, Urgency::Normal),
        coordinator.handle_rebalance(&signal, &lease),
    );
    let manual = manual.unwrap();
    let report = report.unwrap();

    assert_eq!(report.event.response_action, ResponseAction::EmergencyReplicaAdopted);
    assert_eq!(report.event.replica_id.as_deref(), Some(manual.id.as_str()));
    let live = live_replicas(&h);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].urgency, Urgency::High);
    assert_eq!(h.sim.launch_count(), 1);
}
