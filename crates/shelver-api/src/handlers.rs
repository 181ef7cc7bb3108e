//! Control API handlers.
//!
//! Each handler goes through the `LifecycleHandle` and returns the
//! `ApiResponse` JSON envelope.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::warn;

use shelver_lifecycle::LifecycleError;
use shelver_state::{Actor, InstanceRecord};

use crate::ApiState;

/// Upper bound for `GET /api/events?limit=`.
const MAX_EVENTS: usize = 500;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
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

fn request_response(result: Result<InstanceRecord, LifecycleError>) -> axum::response::Response {
    match result {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => {
            warn!(error = %e, "control request rejected");
            let status = match e {
                LifecycleError::Closed => StatusCode::SERVICE_UNAVAILABLE,
                LifecycleError::Audit(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(&e.to_string(), status).into_response()
        }
    }
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/status
pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.lifecycle.status())
}

#[derive(Debug, serde::Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// GET /api/events
pub async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).min(MAX_EVENTS);
    ApiResponse::ok(state.lifecycle.recent_events(limit))
}

// ── Control ────────────────────────────────────────────────────

/// POST /api/unshelve
pub async fn unshelve(State(state): State<ApiState>) -> impl IntoResponse {
    request_response(state.lifecycle.request_unshelve(Actor::Operator).await)
}

/// POST /api/wake
pub async fn wake(State(state): State<ApiState>) -> impl IntoResponse {
    request_response(state.lifecycle.request_unshelve(Actor::Public).await)
}

/// POST /api/shelve
pub async fn shelve(State(state): State<ApiState>) -> impl IntoResponse {
    request_response(state.lifecycle.request_shelve(Actor::Operator).await)
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use shelver_audit::{AuditLog, AuditLogOptions};
    use shelver_core::SystemClock;
    use shelver_gateway::PowerState;
    use shelver_gateway::fake::FakeCompute;
    use shelver_health::ReadinessProber;
    use shelver_health::fake::ScriptedProbe;
    use shelver_lifecycle::{LifecycleHandle, LifecycleMachine, LifecycleSettings};

    use super::*;
    use crate::build_router;

    struct TestApi {
        _dir: tempfile::TempDir,
        router: axum::Router,
        compute: Arc<FakeCompute>,
        _shutdown: watch::Sender<bool>,
    }

    fn machine(dir: &tempfile::TempDir, compute: Arc<FakeCompute>) -> (LifecycleMachine, LifecycleHandle) {
        let audit = AuditLog::open(
            AuditLogOptions {
                sync: false,
                ..AuditLogOptions::new(dir.path().join("events.jsonl"))
            },
            None,
        )
        .unwrap();
        LifecycleMachine::new(
            LifecycleSettings {
                instance_id: "gpu".into(),
                compute_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(1800),
                recent: 50,
            },
            compute,
            ReadinessProber::new(
                Arc::new(ScriptedProbe::never_ready()),
                Duration::from_secs(2),
                Duration::from_secs(600),
            ),
            Arc::new(audit),
            Arc::new(SystemClock),
        )
    }

    fn test_api() -> TestApi {
        let dir = tempfile::tempdir().unwrap();
        let compute = Arc::new(FakeCompute::new(PowerState::Shelved));
        let (machine, handle) = machine(&dir, compute.clone());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(machine.run(rx));
        TestApi {
            _dir: dir,
            router: build_router(handle),
            compute,
            _shutdown: tx,
        }
    }

    async fn call(router: &axum::Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_reports_shelved_instance() {
        let api = test_api();
        let (status, body) = call(&api.router, "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["instance"]["status"], "shelved");
        assert_eq!(body["data"]["idle_timeout_secs"], 1800);
        assert!(body["data"]["next_auto_shelve_at"].is_null());
    }

    #[tokio::test]
    async fn unshelve_then_repeat_is_idempotent() {
        let api = test_api();
        let (status, body) = call(&api.router, "POST", "/api/unshelve").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "unshelving");

        let (status, body) = call(&api.router, "POST", "/api/unshelve").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "unshelving");

        let (_, events) = call(&api.router, "GET", "/api/events").await;
        let requested = events["data"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["kind"] == "ManualUnshelveRequested")
            .count();
        assert_eq!(requested, 1);
        assert!(api.compute.start_calls() <= 1);
    }

    #[tokio::test]
    async fn wake_is_recorded_as_public() {
        let api = test_api();
        let (status, _) = call(&api.router, "POST", "/api/wake").await;
        assert_eq!(status, StatusCode::OK);

        let (_, events) = call(&api.router, "GET", "/api/events?limit=10").await;
        let events = events["data"].as_array().unwrap().clone();
        assert!(!events.is_empty());
        assert_eq!(events[0]["kind"], "PublicWakeRequested");
        assert_eq!(events[0]["actor"], "public");
    }

    #[tokio::test]
    async fn shelve_when_shelved_is_a_noop() {
        let api = test_api();
        let (status, body) = call(&api.router, "POST", "/api/shelve").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "shelved");
        assert_eq!(api.compute.shelve_calls(), 0);
    }

    #[tokio::test]
    async fn stopped_machine_yields_service_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (machine, handle) = machine(&dir, Arc::new(FakeCompute::new(PowerState::Shelved)));
        drop(machine);
        let router = build_router(handle);

        let (status, body) = call(&router, "POST", "/api/unshelve").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);

        // Reads still work from the last snapshot.
        let (status, _) = call(&router, "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unrecordable_request_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("audit");
        let audit = AuditLog::open(
            AuditLogOptions {
                max_bytes: 1,
                sync: false,
                ..AuditLogOptions::new(log_dir.join("events.jsonl"))
            },
            None,
        )
        .unwrap();
        audit
            .append(shelver_state::AuditEvent::new(
                shelver_state::AuditKind::InstanceShelved,
                "gpu",
                Actor::Controller,
                chrono::Utc::now(),
            ))
            .unwrap();
        let compute = Arc::new(FakeCompute::new(PowerState::Shelved));
        let (machine, handle) = LifecycleMachine::new(
            LifecycleSettings {
                instance_id: "gpu".into(),
                compute_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(1800),
                recent: 50,
            },
            compute.clone(),
            ReadinessProber::new(
                Arc::new(ScriptedProbe::never_ready()),
                Duration::from_secs(2),
                Duration::from_secs(600),
            ),
            Arc::new(audit),
            Arc::new(SystemClock),
        );
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(machine.run(rx));
        std::fs::remove_dir_all(&log_dir).unwrap();

        let (status, body) = call(&build_router(handle), "POST", "/api/unshelve").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(compute.start_calls(), 0);
    }

    #[tokio::test]
    async fn healthz_is_plain_text() {
        let api = test_api();
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = api.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
