//! REST API handlers.
//!
//! Reads go straight to the `StateStore`; mutations go through the safety
//! layer or the replica manager so they are audited and logged like
//! automated ones.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use spotwarden_core::{PoolKey, ReplicaOrigin, Urgency};
use spotwarden_replica::{ProgressReport, ReplicaError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

fn replica_error(e: ReplicaError) -> axum::response::Response {
    let status = match &e {
        ReplicaError::NotFound(_) | ReplicaError::ParentNotFound(_) => StatusCode::NOT_FOUND,
        ReplicaError::ManualDisabled => StatusCode::FORBIDDEN,
        ReplicaError::ParentNotPrimary(_)
        | ReplicaError::NotReady { .. }
        | ReplicaError::InvalidTransition { .. }
        | ReplicaError::Terminal { .. }
        | ReplicaError::SlotOccupied { .. } => StatusCode::CONFLICT,
        ReplicaError::NoCompatiblePool(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ReplicaError::Provider(_) => StatusCode::BAD_GATEWAY,
        ReplicaError::PromotionTimeout { .. }
        | ReplicaError::PromotionFailed(_)
        | ReplicaError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Arena and audit history ────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_instances() {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/workloads/{id}/decisions
pub async fn list_decisions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_decisions(&id) {
        Ok(decisions) => ApiResponse::ok(decisions).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/workloads/{id}/switch-events
pub async fn list_switch_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_switch_events(&id) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/workloads/{id}/interruptions
pub async fn list_interruptions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_interruption_events(&id) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => internal(e),
    }
}

// ── Safety controls ────────────────────────────────────────────

/// GET /api/v1/workloads/{id}/control
pub async fn get_control(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.safety.control(&id) {
        Ok(control) => ApiResponse::ok(control).into_response(),
        Err(e) => internal(e),
    }
}

/// POST /api/v1/workloads/{id}/breaker/reset
pub async fn reset_breaker(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.safety.reset_breaker(&id, state.clock.now()) {
        Ok(control) => {
            info!(workload = %id, "circuit breaker reset by operator");
            ApiResponse::ok(control).into_response()
        }
        Err(e) => internal(e),
    }
}

/// POST /api/v1/workloads/{id}/review/clear
pub async fn clear_review(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.safety.clear_review(&id, state.clock.now()) {
        Ok(control) => {
            info!(workload = %id, "manual review cleared by operator");
            ApiResponse::ok(control).into_response()
        }
        Err(e) => internal(e),
    }
}

// ── Replicas ───────────────────────────────────────────────────

/// Manual replica request. Both fields are optional: the parent defaults
/// to the workload's live primary, the pool to the cheapest compatible one.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CreateReplicaRequest {
    #[serde(default)]
    pub parent_instance_id: Option<String>,
    #[serde(default)]
    pub target_pool: Option<PoolKey>,
}

/// GET /api/v1/workloads/{id}/replicas
pub async fn list_replicas(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.replicas.list_for_workload(&id) {
        Ok(replicas) => ApiResponse::ok(replicas).into_response(),
        Err(e) => replica_error(e),
    }
}

/// POST /api/v1/workloads/{id}/replicas
pub async fn create_replica(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CreateReplicaRequest>,
) -> impl IntoResponse {
    let parent = match req.parent_instance_id {
        Some(parent) => match state.store.get_instance(&parent) {
            Ok(Some(inst)) if inst.workload_id == id => inst.id,
            Ok(Some(_)) => {
                return error_response(
                    &format!("instance {parent} does not belong to workload {id}"),
                    StatusCode::BAD_REQUEST,
                )
                .into_response();
            }
            Ok(None) => {
                return error_response("instance not found", StatusCode::NOT_FOUND).into_response();
            }
            Err(e) => return internal(e),
        },
        None => match state.store.live_primary(&id) {
            Ok(Some(primary)) => primary.id,
            Ok(None) => {
                return error_response("workload has no live primary", StatusCode::NOT_FOUND)
                    .into_response();
            }
            Err(e) => return internal(e),
        },
    };

    match state
        .replicas
        .create(&parent, req.target_pool, ReplicaOrigin::Manual, Urgency::Normal)
        .await
    {
        Ok(replica) => (StatusCode::CREATED, ApiResponse::ok(replica)).into_response(),
        Err(e) => replica_error(e),
    }
}

/// DELETE /api/v1/replicas/{id}
pub async fn terminate_replica(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.replicas.terminate(&id, "terminated by operator").await {
        Ok(replica) => ApiResponse::ok(replica).into_response(),
        Err(e) => replica_error(e),
    }
}

/// POST /api/v1/replicas/{id}/progress
pub async fn report_progress(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(report): Json<ProgressReport>,
) -> impl IntoResponse {
    match state.replicas.report_progress(&id, &report) {
        Ok(replica) => ApiResponse::ok(replica).into_response(),
        Err(e) => replica_error(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use spotwarden_core::{
        Instance, InstanceRole, InstanceStatus, Lifecycle, ManualClock, ReplicaConfig,
        SafetyConfig, SyncStatus,
    };
    use spotwarden_provider::RetryPolicy;
    use spotwarden_provider::sim::{SimExecutor, SimWorld};
    use spotwarden_replica::ReplicaManager;
    use spotwarden_safety::{RecordingAlertSink, SafetyLayer};
    use spotwarden_state::StateStore;

    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let sim = Arc::new(SimExecutor::new(SimWorld::default(), clock.clone()));
        let safety = SafetyLayer::new(
            store.clone(),
            &SafetyConfig::default(),
            Arc::new(RecordingAlertSink::new()),
        );
        let replicas = ReplicaManager::new(
            store.clone(),
            sim,
            clock.clone(),
            ReplicaConfig::default(),
            RetryPolicy::no_retry(),
        );
        ApiState {
            store,
            safety,
            replicas,
            clock,
        }
    }

    fn primary(id: &str, workload: &str) -> Instance {
        Instance {
            id: id.to_string(),
            workload_id: workload.to_string(),
            instance_type: "m5.large".to_string(),
            region: "us-east-1".to_string(),
            az: "us-east-1a".to_string(),
            lifecycle: Lifecycle::Spot,
            role: InstanceRole::Primary,
            status: InstanceStatus::Running,
            created_at: NOW - 60,
            terminated_at: None,
        }
    }

    #[tokio::test]
    async fn list_instances_empty() {
        let state = test_state();
        let resp = list_instances(State(state)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn control_defaults_for_unknown_workload() {
        let state = test_state();
        let resp = get_control(State(state), Path("web".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_replica_without_primary_is_not_found() {
        let state = test_state();
        let resp = create_replica(
            State(state),
            Path("web".to_string()),
            Json(CreateReplicaRequest::default()),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_replica_rejects_foreign_parent() {
        let state = test_state();
        state.store.put_instance(&primary("i-1", "batch")).unwrap();
        let req = CreateReplicaRequest {
            parent_instance_id: Some("i-1".to_string()),
            target_pool: None,
        };
        let resp = create_replica(State(state), Path("web".to_string()), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn terminate_unknown_replica_is_not_found() {
        let state = test_state();
        let resp = terminate_replica(State(state), Path("rep-missing".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn progress_for_unknown_replica_is_not_found() {
        let state = test_state();
        let report = ProgressReport {
            sync_status: SyncStatus::Syncing,
            transfer_progress: 10,
            sync_latency_ms: 0,
        };
        let resp = report_progress(State(state), Path("rep-missing".to_string()), Json(report)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn slot_occupied_maps_to_conflict() {
        let resp = replica_error(ReplicaError::SlotOccupied {
            parent: "i-1".to_string(),
            existing: "rep-1".to_string(),
        });
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(replica_error(ReplicaError::ManualDisabled).status(), StatusCode::FORBIDDEN);
    }
}
