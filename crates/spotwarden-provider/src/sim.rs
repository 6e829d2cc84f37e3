//! Deterministic in-memory provider.
//!
//! `SimExecutor` keeps a small world of instances, usage samples, and pool
//! prices behind a mutex, records every mutating call, and exposes fault
//! knobs (transient/fatal failures, instances that never reach running,
//! slow waits). `StaticOracle` and `RecordingAgent` complete the set.
//! Waits resolve immediately unless a wait delay is configured.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use spotwarden_core::{
    Clock, Forecast, InstanceId, InstanceStatus, PoolKey, PoolPrice, PricingSnapshot,
    UsageSample, instance_family,
};

use crate::agent::WorkloadAgent;
use crate::error::{ForecastError, ProviderError, ProviderResult};
use crate::executor::{Executor, InstanceDescription, LaunchSpec, ProviderFuture};
use crate::oracle::{OracleFuture, PriceOracle};

/// A forecast entry in a world file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimForecast {
    pub pool: PoolKey,
    pub predicted_price: f64,
    pub confidence: f64,
}

/// Initial contents of a simulated provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SimWorld {
    #[serde(default)]
    pub instances: Vec<InstanceDescription>,
    #[serde(default)]
    pub usage: HashMap<InstanceId, UsageSample>,
    /// Usage reported for instances without an explicit entry.
    #[serde(default)]
    pub default_usage: Option<UsageSample>,
    #[serde(default)]
    pub pools: Vec<PoolPrice>,
    #[serde(default)]
    pub forecasts: Vec<SimForecast>,
}

impl SimWorld {
    pub fn from_json_file(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Fault injection knobs.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// Next N read calls fail with a transient error.
    pub transient_failures: u32,
    /// Usage metric reads fail fatally.
    pub metrics_fatal: bool,
    /// Next N launches fail with a transient error.
    pub launch_failures: u32,
    /// Launches fail fatally.
    pub launch_fatal: bool,
    /// Launched instances stay pending and never reach running.
    pub hold_pending: bool,
    /// Time every wait takes before reporting (capped at the wait timeout).
    pub wait_delay: Duration,
    /// Terminate calls are refused.
    pub terminate_refused: bool,
}

struct SimState {
    instances: HashMap<InstanceId, InstanceDescription>,
    usage: HashMap<InstanceId, UsageSample>,
    default_usage: Option<UsageSample>,
    pools: Vec<PoolPrice>,
    faults: SimFaults,
    calls: Vec<String>,
    next_id: u64,
}

impl SimState {
    fn take_transient(&mut self, op: &str) -> ProviderResult<()> {
        if self.faults.transient_failures > 0 {
            self.faults.transient_failures -= 1;
            return Err(ProviderError::Transient(format!("{op}: simulated throttling")));
        }
        Ok(())
    }
}

/// In-memory `Executor`.
pub struct SimExecutor {
    state: Mutex<SimState>,
    clock: Arc<dyn Clock>,
}

impl SimExecutor {
    pub fn new(world: SimWorld, clock: Arc<dyn Clock>) -> Self {
        let instances = world
            .instances
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();
        Self {
            state: Mutex::new(SimState {
                instances,
                usage: world.usage,
                default_usage: world.default_usage,
                pools: world.pools,
                faults: SimFaults::default(),
                calls: Vec::new(),
                next_id: 1,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A poisoned sim means a test already panicked; keep the data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adjust fault injection.
    pub fn set_faults(&self, f: impl FnOnce(&mut SimFaults)) {
        f(&mut self.lock().faults);
    }

    /// Mutating calls seen so far (`launch:...`, `terminate:...`).
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with("launch:"))
            .count()
    }

    pub fn instance(&self, id: &str) -> Option<InstanceDescription> {
        self.lock().instances.get(id).cloned()
    }

    pub fn set_status(&self, id: &str, status: InstanceStatus) {
        if let Some(inst) = self.lock().instances.get_mut(id) {
            inst.status = status;
        }
    }

    pub fn set_usage(&self, id: &str, usage: UsageSample) {
        self.lock().usage.insert(id.to_string(), usage);
    }

    /// Insert or replace a pool's price sample.
    pub fn upsert_pool(&self, price: PoolPrice) {
        let mut state = self.lock();
        state.pools.retain(|p| p.key != price.key);
        state.pools.push(price);
    }
}

impl Executor for SimExecutor {
    fn get_instance_state<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, InstanceDescription> {
        Box::pin(async move {
            let mut state = self.lock();
            state.take_transient("get_instance_state")?;
            state
                .instances
                .get(id)
                .cloned()
                .ok_or_else(|| ProviderError::Fatal(format!("instance {id} not found")))
        })
    }

    fn get_usage_metrics<'a>(
        &'a self,
        id: &'a str,
        window: Duration,
    ) -> ProviderFuture<'a, UsageSample> {
        Box::pin(async move {
            let mut state = self.lock();
            state.take_transient("get_usage_metrics")?;
            if state.faults.metrics_fatal {
                return Err(ProviderError::Fatal(format!(
                    "not authorized to read metrics for {id}"
                )));
            }
            let mut sample = state
                .usage
                .get(id)
                .or(state.default_usage.as_ref())
                .cloned()
                .ok_or_else(|| ProviderError::Transient(format!("no metrics yet for {id}")))?;
            sample.window_secs = window.as_secs();
            Ok(sample)
        })
    }

    fn get_pricing_snapshot<'a>(
        &'a self,
        instance_type: &'a str,
        region: &'a str,
        pools: &'a [PoolKey],
    ) -> ProviderFuture<'a, PricingSnapshot> {
        Box::pin(async move {
            let mut state = self.lock();
            state.take_transient("get_pricing_snapshot")?;
            let family = instance_family(instance_type);
            let pools = state
                .pools
                .iter()
                .filter(|p| {
                    (p.key.region == region && p.key.family() == family) || pools.contains(&p.key)
                })
                .cloned()
                .collect();
            Ok(PricingSnapshot {
                captured_at: self.clock.now(),
                pools,
            })
        })
    }

    fn launch_instance<'a>(&'a self, spec: &'a LaunchSpec) -> ProviderFuture<'a, InstanceId> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(format!(
                "launch:{}:{}:{:?}",
                spec.instance_type, spec.az, spec.lifecycle
            ));
            if state.faults.launch_fatal {
                return Err(ProviderError::Fatal("insufficient permissions to launch".into()));
            }
            if state.faults.launch_failures > 0 {
                state.faults.launch_failures -= 1;
                return Err(ProviderError::Transient("insufficient capacity".into()));
            }
            let id = format!("sim-i-{}", state.next_id);
            state.next_id += 1;
            let status = if state.faults.hold_pending {
                InstanceStatus::Pending
            } else {
                InstanceStatus::Running
            };
            state.instances.insert(
                id.clone(),
                InstanceDescription {
                    id: id.clone(),
                    instance_type: spec.instance_type.clone(),
                    region: spec.region.clone(),
                    az: spec.az.clone(),
                    lifecycle: spec.lifecycle,
                    status,
                    launched_at: self.clock.now(),
                },
            );
            debug!(instance = %id, instance_type = %spec.instance_type, "sim instance launched");
            Ok(id)
        })
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(format!("terminate:{id}"));
            if state.faults.terminate_refused {
                return Ok(false);
            }
            match state.instances.get_mut(id) {
                Some(inst) => {
                    inst.status = InstanceStatus::Terminated;
                    Ok(true)
                }
                None => Err(ProviderError::Fatal(format!("instance {id} not found"))),
            }
        })
    }

    fn wait_for_instance_state<'a>(
        &'a self,
        id: &'a str,
        target: InstanceStatus,
        timeout: Duration,
    ) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let delay = self.lock().faults.wait_delay.min(timeout);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let state = self.lock();
            Ok(state
                .instances
                .get(id)
                .is_some_and(|inst| inst.status == target))
        })
    }
}

/// Oracle answering from a fixed table.
#[derive(Default)]
pub struct StaticOracle {
    forecasts: Mutex<HashMap<PoolKey, Forecast>>,
    unavailable: AtomicBool,
    calls: AtomicU32,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_world(world: &SimWorld) -> Self {
        let oracle = Self::new();
        for f in &world.forecasts {
            oracle.set(
                f.pool.clone(),
                Forecast {
                    predicted_price: f.predicted_price,
                    confidence: f.confidence,
                },
            );
        }
        oracle
    }

    pub fn set(&self, pool: PoolKey, forecast: Forecast) {
        self.forecasts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pool, forecast);
    }

    /// Simulate the oracle being down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PriceOracle for StaticOracle {
    fn predict<'a>(&'a self, pool: &'a PoolKey, _at: u64, _recent_prices: &'a [f64]) -> OracleFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(ForecastError::Unavailable("oracle unreachable".into()));
            }
            self.forecasts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(pool)
                .copied()
                .ok_or_else(|| ForecastError::Unavailable(format!("no model for {pool}")))
        })
    }
}

/// Agent that records calls and can be told to fail.
#[derive(Default)]
pub struct RecordingAgent {
    calls: Mutex<Vec<String>>,
    fail_transfer: AtomicBool,
    fail_snapshot: AtomicBool,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_transfer(&self, fail: bool) {
        self.fail_transfer.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_snapshot(&self, fail: bool) {
        self.fail_snapshot.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }
}

impl WorkloadAgent for RecordingAgent {
    fn halt_non_critical<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("halt:{instance_id}"));
            Ok(())
        })
    }

    fn transfer_final_delta<'a>(
        &'a self,
        primary: &'a str,
        replica: &'a str,
        _budget: Duration,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("delta:{primary}->{replica}"));
            if self.fail_transfer.load(Ordering::SeqCst) {
                return Err(ProviderError::Transient("delta transfer interrupted".into()));
            }
            Ok(())
        })
    }

    fn persist_emergency_snapshot<'a>(&'a self, primary: &'a str) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.record(format!("snapshot:{primary}"));
            if self.fail_snapshot.load(Ordering::SeqCst) {
                return Err(ProviderError::Transient("snapshot upload failed".into()));
            }
            Ok(format!("snap-{primary}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotwarden_core::{InstanceRole, InstanceShape, Lifecycle, ManualClock};

    fn pool(az: &str, instance_type: &str) -> PoolPrice {
        PoolPrice {
            key: PoolKey::new("us-east-1", az, instance_type),
            shape: InstanceShape {
                vcpus: 2,
                memory_mib: 8192,
            },
            spot_price: 0.03,
            on_demand_price: 0.096,
            observed_at: 1000,
            recent_prices: vec![0.03],
            interruption_rate: 0.05,
        }
    }

    fn sim() -> SimExecutor {
        let world = SimWorld {
            pools: vec![
                pool("us-east-1a", "m5.large"),
                pool("us-east-1b", "m5.xlarge"),
                pool("us-east-1a", "c5.large"),
            ],
            ..Default::default()
        };
        SimExecutor::new(world, Arc::new(ManualClock::new(1000)))
    }

    fn launch_spec() -> LaunchSpec {
        LaunchSpec {
            workload_id: "web".to_string(),
            instance_type: "m5.large".to_string(),
            region: "us-east-1".to_string(),
            az: "us-east-1a".to_string(),
            lifecycle: Lifecycle::Spot,
            role: InstanceRole::Primary,
        }
    }

    #[tokio::test]
    async fn pricing_snapshot_filters_by_family() {
        let sim = sim();
        let snap = sim
            .get_pricing_snapshot("m5.large", "us-east-1", &[])
            .await
            .unwrap();
        assert_eq!(snap.pools.len(), 2);
        assert_eq!(snap.captured_at, 1000);
    }

    #[tokio::test]
    async fn launch_then_wait_running() {
        let sim = sim();
        let id = sim.launch_instance(&launch_spec()).await.unwrap();
        assert!(
            sim.wait_for_instance_state(&id, InstanceStatus::Running, Duration::from_secs(1))
                .await
                .unwrap()
        );
        assert_eq!(sim.launch_count(), 1);
    }

    #[tokio::test]
    async fn held_instances_never_run() {
        let sim = sim();
        sim.set_faults(|f| f.hold_pending = true);
        let id = sim.launch_instance(&launch_spec()).await.unwrap();
        assert!(
            !sim.wait_for_instance_state(&id, InstanceStatus::Running, Duration::from_secs(1))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn transient_faults_are_consumed() {
        let sim = sim();
        sim.set_faults(|f| f.transient_failures = 1);
        assert!(sim.get_pricing_snapshot("m5.large", "us-east-1", &[]).await.is_err());
        assert!(sim.get_pricing_snapshot("m5.large", "us-east-1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn terminate_marks_instance() {
        let sim = sim();
        let id = sim.launch_instance(&launch_spec()).await.unwrap();
        assert!(sim.terminate_instance(&id).await.unwrap());
        assert_eq!(sim.instance(&id).unwrap().status, InstanceStatus::Terminated);
        assert!(sim.terminate_instance("i-404").await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn static_oracle_reports_unavailable() {
        let oracle = StaticOracle::new();
        let key = PoolKey::new("us-east-1", "us-east-1a", "m5.large");
        assert!(oracle.predict(&key, 0, &[]).await.is_err());

        oracle.set(
            key.clone(),
            Forecast {
                predicted_price: 0.03,
                confidence: 0.9,
            },
        );
        assert!(oracle.predict(&key, 0, &[]).await.is_ok());

        oracle.set_unavailable(true);
        assert!(oracle.predict(&key, 0, &[]).await.is_err());
        assert_eq!(oracle.call_count(), 3);
    }

    #[test]
    fn world_parses_from_json() {
        let json = r#"{
            "pools": [{
                "key": {"region": "us-east-1", "az": "us-east-1a", "instance_type": "m5.large"},
                "shape": {"vcpus": 2, "memory_mib": 8192},
                "spot_price": 0.03,
                "on_demand_price": 0.096,
                "observed_at": 0
            }]
        }"#;
        let world: SimWorld = serde_json::from_str(json).unwrap();
        assert_eq!(world.pools.len(), 1);
        assert!(world.pools[0].recent_prices.is_empty());
    }
}
