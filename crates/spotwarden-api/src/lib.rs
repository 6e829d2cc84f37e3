//! spotwarden-api — operator REST API.
//!
//! Read access to the instance arena and audit history, plus the few
//! manual controls automation deliberately leaves to a human: breaker
//! reset, clearing a review flag, and manual replicas.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/instances` | Instance arena |
//! | GET | `/api/v1/workloads/{id}/decisions` | Decision history |
//! | GET | `/api/v1/workloads/{id}/switch-events` | Switch history |
//! | GET | `/api/v1/workloads/{id}/interruptions` | Interruption history |
//! | GET | `/api/v1/workloads/{id}/replicas` | Replicas of a workload |
//! | POST | `/api/v1/workloads/{id}/replicas` | Request a manual replica |
//! | GET | `/api/v1/workloads/{id}/control` | Cooldown, breaker and review state |
//! | POST | `/api/v1/workloads/{id}/breaker/reset` | Reset the circuit breaker |
//! | POST | `/api/v1/workloads/{id}/review/clear` | Clear the manual-review flag |
//! | DELETE | `/api/v1/replicas/{id}` | Terminate a replica |
//! | POST | `/api/v1/replicas/{id}/progress` | Agent progress report |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use spotwarden_core::Clock;
use spotwarden_replica::ReplicaManager;
use spotwarden_safety::SafetyLayer;
use spotwarden_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub safety: SafetyLayer,
    pub replicas: ReplicaManager,
    pub clock: Arc<dyn Clock>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/instances", get(handlers::list_instances))
        .route("/workloads/{id}/decisions", get(handlers::list_decisions))
        .route("/workloads/{id}/switch-events", get(handlers::list_switch_events))
        .route("/workloads/{id}/interruptions", get(handlers::list_interruptions))
        .route(
            "/workloads/{id}/replicas",
            get(handlers::list_replicas).post(handlers::create_replica),
        )
        .route("/workloads/{id}/control", get(handlers::get_control))
        .route("/workloads/{id}/breaker/reset", post(handlers::reset_breaker))
        .route("/workloads/{id}/review/clear", post(handlers::clear_review))
        .route("/replicas/{id}", delete(handlers::terminate_replica))
        .route("/replicas/{id}/progress", post(handlers::report_progress))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
