//! Health check endpoints.
//!
//! Used by the orchestrator to decide whether the pool manager is alive and
//! can reach its registry.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

const SERVICE_NAME: &str = "pool-manager";

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// RFC 3339 timestamp.
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<ComponentStatus>,
}

/// Status of the worker registry backend.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub backend: String,

    /// "ok" or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, registry: Option<ComponentStatus>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        registry,
    }
}

/// Is the process up? Does not check the registry.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Can the registry be reached? Returns 503 when it cannot.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry();
    let result = registry.health_check(state.shutdown()).await;

    if let Err(e) = &result {
        tracing::warn!(backend = registry.backend(), error = %e, "Registry health check failed");
    }

    let ok = result.is_ok();
    let component = ComponentStatus {
        backend: registry.backend().to_string(),
        status: if ok { "ok" } else { "unavailable" }.to_string(),
        message: result.err().map(|e| e.to_string()),
    };

    if ok {
        (StatusCode::OK, Json(response("ok", Some(component))))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(response("degraded", Some(component))),
        )
    }
}

/// Minimal liveness check.
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::api::create_router;
    use crate::registry::MemoryRegistry;
    use crate::shutdown::Shutdown;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_reports_registry_backend() {
        let registry = Arc::new(MemoryRegistry::new());
        let app = create_router(AppState::new(registry, Shutdown::never()));

        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: HealthResponse = serde_json::from_slice(&bytes).unwrap();
        let component = body.registry.unwrap();
        assert_eq!(component.backend, "memory");
        assert_eq!(component.status, "ok");
    }

    #[tokio::test]
    async fn test_readyz_unavailable_after_shutdown() {
        let registry = Arc::new(MemoryRegistry::new());
        let (signal, shutdown) = crate::shutdown::channel();
        signal.trigger();
        let app = create_router(AppState::new(registry, shutdown));

        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
