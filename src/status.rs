//! Read-only HTTP view of the current elections, for operators and status
//! pages. Embedders can mount [`router`] into their own server or run the
//! standalone [`run_status_server`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::tracker::ReplicaTracker;

#[derive(Clone)]
pub struct StatusState {
    pub tracker: Arc<ReplicaTracker>,
}

#[derive(Serialize)]
pub struct ElectedReplicaResponse {
    tenant: String,
    replica_group: String,
    replica: String,
    received_at: i64,
    last_update_seconds: i64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    healthy: bool,
}

pub fn router(tracker: Arc<ReplicaTracker>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ha-tracker", get(elected_replicas_handler))
        .route("/api/ha-tracker/health", get(health_handler))
        .layer(cors)
        .with_state(StatusState { tracker })
}

pub async fn elected_replicas_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let now_ms = Utc::now().timestamp_millis();
    let mut rows: Vec<ElectedReplicaResponse> = state
        .tracker
        .snapshot_elected()
        .await
        .into_iter()
        .filter_map(|(key, desc)| {
            let (tenant, replica_group) = key.split_once('/')?;
            Some(ElectedReplicaResponse {
                tenant: tenant.to_string(),
                replica_group: replica_group.to_string(),
                replica: desc.replica,
                received_at: desc.received_at,
                last_update_seconds: (now_ms - desc.received_at) / 1000,
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.tenant, &a.replica_group).cmp(&(&b.tenant, &b.replica_group))
    });

    Json(rows)
}

/// Reports whether the tracker's watch is keeping the cache current.
/// Returns 503 once the watch has failed persistently, so the endpoint
/// can back a readiness probe.
pub async fn health_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let healthy = state.tracker.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(HealthResponse { healthy }))
}

/// Serve the status API until the token is cancelled.
pub async fn run_status_server(
    addr: SocketAddr,
    tracker: Arc<ReplicaTracker>,
    cancel: CancellationToken,
) {
    let app = router(tracker);

    tracing::info!(addr = %addr, "Starting HA tracker status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Status server failed");
    }
}
