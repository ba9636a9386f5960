//! Local API Server

use crate::health::{HealthState, HealthStatus};
use crate::reconciler::{CycleReport, LoopPhase};
use crate::{EnforcementState, FabricController, FabricError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(controller: Arc<FabricController>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/scopes/:scope/reconcile", post(reconcile))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

/// Start local API server
pub async fn serve(controller: Arc<FabricController>, addr: &str) -> Result<(), FabricError> {
    let app = router(controller);
    tracing::info!("Reconciler API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| FabricError::Api(e.to_string()))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| FabricError::Api(e.to_string()))
}

async fn health(State(controller): State<Arc<FabricController>>) -> (StatusCode, Json<HealthStatus>) {
    let status = controller.health();
    let code = match status.overall {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(status))
}

async fn status(State(controller): State<Arc<FabricController>>) -> Json<StatusResponse> {
    let scopes = controller
        .scopes()
        .into_iter()
        .filter_map(|scope| {
            let handle = controller.handle(&scope)?;
            Some(ScopeStatus {
                phase: handle.phase(),
                last_cycle: handle.last_report(),
                scope,
            })
        })
        .collect();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").into(),
        enforcement: controller.enforcement(),
        scopes,
    })
}

async fn metrics(State(controller): State<Arc<FabricController>>) -> String {
    controller.metrics().export_prometheus()
}

async fn reconcile(
    State(controller): State<Arc<FabricController>>,
    Path(scope): Path<String>,
) -> StatusCode {
    if controller.trigger(&scope) {
        tracing::info!(scope = %scope, "Reconcile requested");
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    enforcement: EnforcementState,
    scopes: Vec<ScopeStatus>,
}

#[derive(Serialize)]
struct ScopeStatus {
    scope: String,
    phase: LoopPhase,
    last_cycle: Option<CycleReport>,
}
