//! Daemon wiring: store, simulated provider, control plane and API server.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use spotwarden_api::ApiState;
use spotwarden_core::{Clock, Instance, InstanceRole, SpotwardenConfig, SystemClock};
use spotwarden_orchestrator::{ControlPlane, DecisionCycle, Dispatcher};
use spotwarden_provider::RetryPolicy;
use spotwarden_provider::sim::{RecordingAgent, SimExecutor, SimWorld, StaticOracle};
use spotwarden_replica::{ChannelSignalSource, FailoverCoordinator, InterruptionSignal, ReplicaManager};
use spotwarden_safety::{SafetyLayer, TracingAlertSink};
use spotwarden_state::StateStore;

/// A world file: the simulated provider plus which instance is the
/// primary of each workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldFile {
    #[serde(flatten)]
    pub sim: SimWorld,
    /// workload id -> instance id
    #[serde(default)]
    pub primaries: BTreeMap<String, String>,
}

impl WorldFile {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Register each workload's primary in the arena unless one is already
/// live (a restart keeps whatever the previous run switched to).
pub fn seed_primaries(
    store: &StateStore,
    config: &SpotwardenConfig,
    world: &WorldFile,
) -> anyhow::Result<usize> {
    let mut seeded = 0;
    for (workload_id, instance_id) in &world.primaries {
        if !config.daemon.workloads.contains(workload_id) {
            warn!(workload = %workload_id, "primary listed for a workload that is not protected");
        }
        if let Some(live) = store.live_primary(workload_id)? {
            info!(workload = %workload_id, instance = %live.id, "primary already registered");
            continue;
        }
        let Some(desc) = world.sim.instances.iter().find(|i| &i.id == instance_id) else {
            bail!("primary {instance_id} of workload {workload_id} is not in the world");
        };
        if desc.region != config.daemon.region {
            warn!(instance = %desc.id, region = %desc.region, "primary outside the configured region");
        }
        store.put_instance(&Instance {
            id: desc.id.clone(),
            workload_id: workload_id.clone(),
            instance_type: desc.instance_type.clone(),
            region: desc.region.clone(),
            az: desc.az.clone(),
            lifecycle: desc.lifecycle,
            role: InstanceRole::Primary,
            status: desc.status,
            created_at: desc.launched_at,
            terminated_at: None,
        })?;
        info!(workload = %workload_id, instance = %desc.id, "primary registered");
        seeded += 1;
    }
    Ok(seeded)
}

/// Everything the daemon runs, assembled but not started.
pub struct Assembly {
    pub plane: ControlPlane,
    pub api: ApiState,
    /// Feeds the signal router; the metadata poller would own this.
    pub signals: mpsc::Sender<InterruptionSignal>,
    pub source: ChannelSignalSource,
}

pub fn assemble(
    config: &SpotwardenConfig,
    world: SimWorld,
    store: StateStore,
    clock: Arc<dyn Clock>,
) -> Assembly {
    let retry = RetryPolicy::from_config(&config.safety);
    let oracle = Arc::new(StaticOracle::from_world(&world));
    let executor = Arc::new(SimExecutor::new(world, clock.clone()));
    let safety = SafetyLayer::new(store.clone(), &config.safety, Arc::new(TracingAlertSink));
    let replicas = ReplicaManager::new(
        store.clone(),
        executor.clone(),
        clock.clone(),
        config.replica.clone(),
        retry.clone(),
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        executor.clone(),
        clock.clone(),
        retry.clone(),
        config.engine.dry_run_mode,
        Duration::from_secs(config.replica.replica_launch_timeout_secs),
    );
    let cycle = DecisionCycle::new(
        store.clone(),
        executor,
        oracle,
        clock.clone(),
        safety.clone(),
        replicas.clone(),
        dispatcher,
        retry,
        config.engine.clone(),
    );
    let failover = FailoverCoordinator::new(replicas.clone(), Arc::new(RecordingAgent::new()));
    let plane = ControlPlane::new(cycle, failover, safety.clone(), config.daemon.workloads.clone());
    let (signals, source) = ChannelSignalSource::channel(64);

    Assembly {
        plane,
        api: ApiState {
            store,
            safety,
            replicas,
            clock,
        },
        signals,
        source,
    }
}

pub async fn run(config_path: &Path, world_path: &Path) -> anyhow::Result<()> {
    let config = SpotwardenConfig::from_file(config_path)?;
    let world = WorldFile::from_json_file(world_path)?;
    info!(
        workloads = config.daemon.workloads.len(),
        dry_run = config.engine.dry_run_mode,
        "spotwarden daemon starting"
    );

    std::fs::create_dir_all(&config.daemon.data_dir)
        .with_context(|| format!("creating {}", config.daemon.data_dir.display()))?;
    let db_path = config.daemon.data_dir.join("spotwarden.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let seeded = seed_primaries(&store, &config, &world)?;
    info!(seeded, "arena seeded from world file");

    let assembly = assemble(&config, world.sim, store, Arc::new(SystemClock));
    // Held for the daemon's lifetime so the router keeps listening.
    let _signals = assembly.signals;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let plane = assembly.plane.clone();
    let cycle_shutdown = shutdown_rx.clone();
    let interval = Duration::from_secs(config.daemon.cycle_interval_secs);
    let cycle_handle = tokio::spawn(async move {
        plane.run(interval, cycle_shutdown).await;
    });

    let plane = assembly.plane;
    let source = assembly.source;
    let signal_shutdown = shutdown_rx;
    let signal_handle = tokio::spawn(async move {
        plane.run_signals(Box::new(source), signal_shutdown).await;
    });

    let router = spotwarden_api::build_router(assembly.api);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.daemon.api_port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler failed");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = cycle_handle.await;
    let _ = signal_handle.await;
    info!("spotwarden daemon stopped");
    Ok(())
}
