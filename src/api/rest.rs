//! REST API Handlers
//!
//! Implements the claim lifecycle endpoints consumed by the cluster's
//! transport layer: prepare, unprepare, and driver status.

use crate::driver::Driver;
use crate::error::Error;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Prepare response carrying the devices to hand to the workload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResourceResponse {
    pub claim_uid: String,
    /// Fully-qualified CDI device identifiers
    pub cdi_devices: Vec<String>,
}

/// Unprepare acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnprepareResourceResponse {
    pub claim_uid: String,
    /// "unprepared" for the synchronous path, "deferred" when release is
    /// left to the reconciliation loop
    pub status: String,
}

/// Driver status response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverStatusResponse {
    pub node: String,
    pub ready: bool,
    pub allocated_claims: usize,
    pub prepared_claims: usize,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    driver: Arc<Driver>,
    synchronous_unprepare: bool,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(driver: Arc<Driver>, synchronous_unprepare: bool) -> Self {
        Self {
            driver,
            synchronous_unprepare,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            driver: self.driver,
            synchronous_unprepare: self.synchronous_unprepare,
        };

        Router::new()
            // Claim endpoints
            .route("/v1/claims/:uid/prepare", post(prepare_resource))
            .route("/v1/claims/:uid/unprepare", post(unprepare_resource))
            // Status endpoint
            .route("/v1/status", get(driver_status))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    driver: Arc<Driver>,
    synchronous_unprepare: bool,
}

// =============================================================================
// Handlers
// =============================================================================

/// Prepare devices for a claim
async fn prepare_resource(
    State(state): State<AppState>,
    Path(claim_uid): Path<String>,
) -> impl IntoResponse {
    match state.driver.prepare_resource(&claim_uid).await {
        Ok(cdi_devices) => (
            StatusCode::OK,
            Json(PrepareResourceResponse {
                claim_uid,
                cdi_devices,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Prepare failed for claim {}: {}", claim_uid, e);
            let status = prepare_failure_status(&e);
            (
                status,
                Json(ApiErrorResponse {
                    error: "prepare_failed".into(),
                    message: e.to_string(),
                    details: None,
                }),
            )
                .into_response()
        }
    }
}

/// Acknowledge an unprepare request.
///
/// By default release is deferred: the control plane removes the claim from
/// the allocated set and the reconciliation loop unprepares it when the
/// change is observed. The synchronous path exists for deployments that
/// cannot tolerate that release window.
async fn unprepare_resource(
    State(state): State<AppState>,
    Path(claim_uid): Path<String>,
) -> impl IntoResponse {
    if !state.synchronous_unprepare {
        info!(
            "Deferring unprepare of claim {} to the reconciliation loop",
            claim_uid
        );
        return (
            StatusCode::ACCEPTED,
            Json(UnprepareResourceResponse {
                claim_uid,
                status: "deferred".into(),
            }),
        )
            .into_response();
    }

    match state.driver.unprepare_resource(&claim_uid).await {
        Ok(()) => (
            StatusCode::OK,
            Json(UnprepareResourceResponse {
                claim_uid,
                status: "unprepared".into(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Unprepare failed for claim {}: {}", claim_uid, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorResponse {
                    error: "unprepare_failed".into(),
                    message: e.to_string(),
                    details: None,
                }),
            )
                .into_response()
        }
    }
}

/// Driver status
async fn driver_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.driver.status().await;
    Json(DriverStatusResponse {
        node: status.node,
        ready: status.ready,
        allocated_claims: status.allocated_claims,
        prepared_claims: status.prepared_claims,
    })
}

/// Liveness
async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness: the driver is ready once the record is marked Ready
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.driver.status().await.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// HTTP status for a failed prepare, by failure class
fn prepare_failure_status(e: &Error) -> StatusCode {
    let source = match e {
        Error::PrepareClaim { source, .. } | Error::CheckPrepared { source, .. } => source.as_ref(),
        other => other,
    };

    match source {
        Error::ClaimNotAllocated { .. } | Error::EmptyAllocation { .. } => StatusCode::NOT_FOUND,
        Error::UnknownDevice { .. } | Error::DeviceBusy { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
