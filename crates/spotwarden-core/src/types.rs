//! Domain types shared across spotwarden crates.
//!
//! Instances form an arena keyed by id; relationships (replica → parent,
//! instance → workload) are plain id fields. Audit records are immutable
//! once built and are only ever appended to the store.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

/// Identifier of a cloud instance.
pub type InstanceId = String;

/// Identifier of a logical workload (the thing being protected).
pub type WorkloadId = String;

/// Identifier of a replica record.
pub type ReplicaId = String;

// ── Instance ──────────────────────────────────────────────────────

/// Purchasing model of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    Spot,
    OnDemand,
}

/// Role of an instance inside its workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    Primary,
    Replica,
    /// Superseded primary, kept only for reference and cleanup.
    Zombie,
}

/// Provider-side state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Terminated,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// An instance in the arena.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub workload_id: WorkloadId,
    pub instance_type: String,
    pub region: String,
    pub az: String,
    pub lifecycle: Lifecycle,
    pub role: InstanceRole,
    pub status: InstanceStatus,
    /// Unix timestamp (seconds) of launch.
    pub created_at: u64,
    /// Unix timestamp (seconds) of termination, once known.
    pub terminated_at: Option<u64>,
}

impl Instance {
    /// Pool this instance currently runs in.
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(&self.region, &self.az, &self.instance_type)
    }

    /// True for a primary that has not been terminated.
    pub fn is_live_primary(&self) -> bool {
        self.role == InstanceRole::Primary && self.status != InstanceStatus::Terminated
    }

    /// Mark the instance terminated at `now`.
    pub fn mark_terminated(&mut self, now: u64) {
        self.status = InstanceStatus::Terminated;
        self.terminated_at.get_or_insert(now);
    }
}

// ── Pools ─────────────────────────────────────────────────────────

/// Identity of a capacity pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub region: String,
    pub az: String,
    pub instance_type: String,
}

impl PoolKey {
    pub fn new(region: &str, az: &str, instance_type: &str) -> Self {
        Self {
            region: region.to_string(),
            az: az.to_string(),
            instance_type: instance_type.to_string(),
        }
    }

    /// Instance family of this pool's type.
    pub fn family(&self) -> &str {
        instance_family(&self.instance_type)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.az, self.instance_type)
    }
}

/// Family prefix of an instance type (`m5.large` → `m5`).
pub fn instance_family(instance_type: &str) -> &str {
    instance_type.split('.').next().unwrap_or(instance_type)
}

/// Compute capacity of an instance type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceShape {
    pub vcpus: u32,
    pub memory_mib: u64,
}

impl InstanceShape {
    /// No dimension larger, at least one strictly smaller.
    pub fn is_smaller_than(&self, other: &InstanceShape) -> bool {
        self.vcpus <= other.vcpus
            && self.memory_mib <= other.memory_mib
            && (self.vcpus < other.vcpus || self.memory_mib < other.memory_mib)
    }

    pub fn is_bigger_than(&self, other: &InstanceShape) -> bool {
        other.is_smaller_than(self)
    }

    /// Same vCPU count and memory within `tolerance` (relative to the larger side).
    pub fn is_similar_to(&self, other: &InstanceShape, tolerance: f64) -> bool {
        if self.vcpus != other.vcpus {
            return false;
        }
        let larger = self.memory_mib.max(other.memory_mib);
        if larger == 0 {
            return true;
        }
        let diff = self.memory_mib.abs_diff(other.memory_mib) as f64;
        diff / larger as f64 <= tolerance
    }
}

/// Spot discount relative to on-demand (0.7 means 70% cheaper).
pub fn discount(price: f64, on_demand_price: f64) -> f64 {
    if on_demand_price <= 0.0 {
        return 0.0;
    }
    1.0 - price / on_demand_price
}

/// One pool's price sample as delivered by the pricing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolPrice {
    pub key: PoolKey,
    pub shape: InstanceShape,
    /// Current spot price per hour.
    pub spot_price: f64,
    /// On-demand price per hour for the same type.
    pub on_demand_price: f64,
    /// Unix timestamp of the latest price sample.
    pub observed_at: u64,
    /// Recent observed spot prices, oldest first.
    #[serde(default)]
    pub recent_prices: Vec<f64>,
    /// Historical interruption frequency for the pool (0.0–1.0).
    #[serde(default)]
    pub interruption_rate: f64,
}

impl PoolPrice {
    pub fn discount(&self) -> f64 {
        discount(self.spot_price, self.on_demand_price)
    }
}

/// Prices for every pool the executor was asked about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PricingSnapshot {
    pub captured_at: u64,
    pub pools: Vec<PoolPrice>,
}

impl PricingSnapshot {
    pub fn get(&self, key: &PoolKey) -> Option<&PoolPrice> {
        self.pools.iter().find(|p| &p.key == key)
    }
}

/// One-hour-ahead forecast from the price oracle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Forecast {
    pub predicted_price: f64,
    /// Oracle confidence (0.0–1.0).
    pub confidence: f64,
}

/// Where a pool's predicted metrics came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastSource {
    Oracle,
    /// Oracle unavailable; recent observed average used instead.
    Fallback,
}

/// A pool with current and predicted metrics attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolView {
    pub key: PoolKey,
    pub shape: InstanceShape,
    pub current_price: f64,
    pub on_demand_price: f64,
    pub discount: f64,
    pub predicted_price_1h: f64,
    pub predicted_discount: f64,
    pub predicted_volatility: f64,
    pub forecast_source: ForecastSource,
}

impl PoolView {
    /// Risk proxy used by the future-improvement comparison.
    pub fn predicted_risk(&self) -> f64 {
        self.predicted_volatility
    }
}

// ── Usage ─────────────────────────────────────────────────────────

/// Resource usage observed over one window, percentages 0–100.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSample {
    pub cpu_p95: f64,
    pub cpu_avg: f64,
    pub memory_p95: f64,
    pub memory_avg: f64,
    pub network_p95: f64,
    pub window_secs: u64,
}

/// Provisioning classification derived from usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageClass {
    OverProvisioned,
    UnderProvisioned,
    RightSized,
}

impl fmt::Display for UsageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OverProvisioned => "OVER_PROVISIONED",
            Self::UnderProvisioned => "UNDER_PROVISIONED",
            Self::RightSized => "RIGHT_SIZED",
        };
        f.write_str(s)
    }
}

// ── Decision ──────────────────────────────────────────────────────

/// The single action chosen for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Stay,
    SwitchToSpot,
    FallbackOndemand,
}

impl ActionType {
    /// Whether the action requires a physical transition.
    pub fn is_transition(self) -> bool {
        !matches!(self, Self::Stay)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stay => "STAY",
            Self::SwitchToSpot => "SWITCH_TO_SPOT",
            Self::FallbackOndemand => "FALLBACK_ONDEMAND",
        };
        f.write_str(s)
    }
}

/// Comparison operator recorded in a threshold check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl ComparisonOp {
    pub fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// One recorded threshold comparison, enough to re-derive the outcome
/// without re-running the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdCheck {
    /// Pipeline stage (1–8) that made the comparison.
    pub stage: u8,
    /// What was compared: a pool key or `usage`.
    pub subject: String,
    pub metric: String,
    pub value: f64,
    pub op: ComparisonOp,
    pub threshold: f64,
    pub passed: bool,
}

impl ThresholdCheck {
    pub fn evaluate(
        stage: u8,
        subject: impl Into<String>,
        metric: &str,
        value: f64,
        op: ComparisonOp,
        threshold: f64,
    ) -> Self {
        Self {
            stage,
            subject: subject.into(),
            metric: metric.to_string(),
            value,
            op,
            threshold,
            passed: op.apply(value, threshold),
        }
    }
}

/// What happened to one candidate pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateOutcome {
    pub pool: PoolKey,
    /// Stage that rejected the pool; `None` means it qualified.
    pub rejected_at: Option<u8>,
    pub reason: Option<String>,
}

/// Full snapshot of the inputs and comparisons behind a decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DecisionMetadata {
    pub config: EngineConfig,
    pub usage: Option<UsageSample>,
    pub usage_class: Option<UsageClass>,
    pub current_pool: Option<PoolView>,
    pub checks: Vec<ThresholdCheck>,
    pub candidates: Vec<CandidateOutcome>,
    /// Candidates that passed every filter, best first.
    pub qualified: Vec<PoolView>,
    pub current_future_ok: Option<bool>,
    pub forecast_degraded: bool,
    pub effective_discount_margin: f64,
    /// Name of the selection rule that produced the action.
    pub matched_rule: Option<String>,
    /// Action the engine chose before a safety gate overrode it.
    pub suppressed_action: Option<ActionType>,
    /// Safety gate that forced the outcome, if any.
    pub gate: Option<String>,
}

/// One decision per workload per cycle. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: String,
    pub workload_id: WorkloadId,
    pub instance_id: InstanceId,
    pub action: ActionType,
    pub target_pool: Option<PoolKey>,
    pub target_instance_type: Option<String>,
    pub reason: String,
    pub cooldown_until: Option<u64>,
    pub decided_at: u64,
    pub dry_run: bool,
    pub success: bool,
    pub metadata: DecisionMetadata,
}

// ── Replica ───────────────────────────────────────────────────────

/// Lifecycle of a standby replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Launching,
    Syncing,
    Ready,
    Promoted,
    Terminated,
    Failed,
}

impl ReplicaStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Promoted | Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Launching => "launching",
            Self::Syncing => "syncing",
            Self::Ready => "ready",
            Self::Promoted => "promoted",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Data sync state reported by the replica agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Initializing,
    Syncing,
    Synced,
    OutOfSync,
}

/// Who asked for a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaOrigin {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    High,
}

/// A standby instance kept warm for one parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replica {
    pub id: ReplicaId,
    pub workload_id: WorkloadId,
    pub parent_instance_id: InstanceId,
    /// Backing instance, once launched.
    pub instance_id: Option<InstanceId>,
    pub pool: Option<PoolKey>,
    pub status: ReplicaStatus,
    pub sync_status: SyncStatus,
    pub sync_latency_ms: u64,
    /// Initial transfer progress, 0–100.
    pub transfer_progress: u8,
    pub created_by: ReplicaOrigin,
    pub urgency: Urgency,
    pub created_at: u64,
    pub ready_at: Option<u64>,
    pub updated_at: u64,
    pub failure_reason: Option<String>,
}

// ── Interruption ──────────────────────────────────────────────────

/// Kind of provider interruption warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Soft warning, tens of minutes ahead.
    RebalanceRecommendation,
    /// Hard warning with a short fixed deadline.
    TerminationNotice,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RebalanceRecommendation => "rebalance-recommendation",
            Self::TerminationNotice => "termination-notice",
        };
        f.write_str(s)
    }
}

/// How the system responded to an interruption signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// Probability below threshold, nothing launched.
    NoReplicaNeeded,
    EmergencyReplicaCreated,
    /// An existing replica was adopted as the emergency standby.
    EmergencyReplicaAdopted,
    ReplicaCreationFailed,
    /// Automatic defense disabled for this workload.
    DefenseDisabled,
    ReplicaPromoted,
    /// No ready replica; snapshot persisted and fresh instance launched.
    EmergencySnapshot,
    /// Handling was preempted by a termination notice.
    Preempted,
    /// The signal could not be handled; the event reason says why.
    Unhandled,
}

/// Append-only record closing the handling of one interruption signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptionEvent {
    pub id: String,
    pub workload_id: WorkloadId,
    pub instance_id: InstanceId,
    pub signal_type: SignalKind,
    pub detected_at: u64,
    pub deadline: u64,
    pub response_action: ResponseAction,
    pub replica_id: Option<ReplicaId>,
    pub success: bool,
    pub reason: String,
    /// Interruption probability estimate, for rebalance recommendations.
    pub probability: Option<f64>,
}

/// What caused a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchTrigger {
    Decision,
    Interruption,
}

/// Append-only record of one completed (or failed) transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitchEvent {
    pub id: String,
    pub workload_id: WorkloadId,
    pub old_instance_id: InstanceId,
    pub new_instance_id: Option<InstanceId>,
    pub trigger: SwitchTrigger,
    pub reason: String,
    pub old_price: f64,
    pub new_price: Option<f64>,
    /// Hourly savings of the new placement vs the old one.
    pub savings_per_hour: f64,
    pub downtime_seconds: f64,
    pub success: bool,
    pub recorded_at: u64,
}

// ── Helpers ───────────────────────────────────────────────────────

static RECORD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Process-unique record id: `{prefix}-{epoch_millis}-{seq}`.
pub fn next_record_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = RECORD_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{millis}-{seq}")
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
