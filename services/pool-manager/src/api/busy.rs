//! Worker status reporting.
//!
//! Workers call `POST /busy` when they pick up a task. The handler only
//! updates the registry; the worker leaves the waiting set and is backfilled
//! by the next reconcile pass, whichever trigger starts it.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use mc_id::WorkerId;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::registry::{RegistryError, WorkerStatus};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/busy", post(mark_busy))
}

/// Body of `POST /busy`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BusyRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// Mark a worker `Running`.
///
/// The request is validated in full before the registry is touched.
async fn mark_busy(
    State(state): State<AppState>,
    payload: Result<Json<BusyRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::bad_request("invalid_payload", rejection.body_text())
    })?;

    let id = parse_worker_id(request.worker_id.as_deref())?;

    state
        .registry()
        .update_status(state.shutdown(), &id, WorkerStatus::Running)
        .await
        .map_err(|e| registry_error(&id, e))?;

    tracing::info!(worker_id = %id, "Worker marked busy");
    Ok(StatusCode::OK)
}

fn parse_worker_id(raw: Option<&str>) -> Result<WorkerId, ApiError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(ApiError::bad_request(
            "missing_worker_id",
            "worker_id is required",
        ));
    }

    WorkerId::parse(raw).map_err(|e| {
        ApiError::bad_request("invalid_worker_id", format!("invalid worker_id: {e}"))
    })
}

fn registry_error(id: &WorkerId, err: RegistryError) -> ApiError {
    match err {
        RegistryError::NotFound(_) => {
            ApiError::not_found("worker_not_found", format!("worker {id} does not exist"))
        }
        other => {
            tracing::warn!(worker_id = %id, error = %other, "Failed to mark worker busy");
            ApiError::bad_request("registry_error", other.to_string())
        }
    }
}
