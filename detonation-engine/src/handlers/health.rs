use axum::{extract::State, http::StatusCode, response::Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::observability::SERVICE_NAME;

/// Service status enum
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ServiceStatus,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub services: ServiceHealth,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub control_plane: ServiceStatus,
}

/// GET /health
///
/// Degraded (503) when the hypervisor control tool cannot be run.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let control_ready = state
        .control
        .execute(&["--version".to_string()])
        .await
        .is_success();

    let response = HealthResponse {
        status: if control_ready {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Degraded
        },
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        services: ServiceHealth {
            control_plane: if control_ready {
                ServiceStatus::Healthy
            } else {
                ServiceStatus::Unhealthy
            },
        },
    };

    let status_code = if response.status == ServiceStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}

#[cfg(test)]
mod tests {
    use crate::handlers::tests::{body_json, send, test_app};
    use crate::sandbox::control::testing::ScriptedControlPlane;
    use crate::sandbox::CommandOutcome;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;

    fn health_request() -> Request<Body> {
        Request::builder().uri("/health").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_healthy_when_control_tool_answers() {
        let (_dir, _state, app) = test_app(Arc::new(ScriptedControlPlane::new()));
        let response = send(&app, health_request()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "detonation-engine");
        assert_eq!(body["services"]["control_plane"], "healthy");
    }

    #[tokio::test]
    async fn test_degraded_when_control_tool_missing() {
        let control = ScriptedControlPlane::new().respond(
            "--version",
            CommandOutcome::ToolNotFound("VBoxManage not found".to_string()),
        );
        let (_dir, _state, app) = test_app(Arc::new(control));
        let response = send(&app, health_request()).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["services"]["control_plane"], "unhealthy");
    }
}
