//! HTTP API for creating, inspecting, stopping and calling into runs.
//!
//! Handlers are thin: they decode the request, call the [`RunOrchestrator`]
//! and let [`RunError`]'s `IntoResponse` pick the status code. Upstream and
//! internal failures are logged here and answered with a generic body.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::RunError;
use crate::orchestrator::run_manager::{
    CreateRunRequest, CreateRunResponse, RunLogs, RunOrchestrator, RunView,
};
use crate::orchestrator::tool_proxy::ToolInvocation;

/// Shared state for the API.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<RunOrchestrator>,
    /// Deadline for one inbound request. Dropping the handler future on
    /// expiry also drops any in-flight platform or tool call.
    pub request_timeout: Duration,
}

/// Body of a tool invocation.
#[derive(Debug, Default, Deserialize)]
pub struct ToolInvokeRequest {
    #[serde(default)]
    pub input: Map<String, Value>,
}

/// The run control plane's HTTP server.
pub struct RunApi;

impl RunApi {
    /// Build the axum router.
    pub fn router(state: ApiState) -> Router {
        let timeout = state.request_timeout;
        Router::new()
            .route("/runs", post(create_run))
            .route("/runs/{run_id}", get(get_run))
            .route("/runs/{run_id}/logs", get(get_logs))
            .route("/runs/{run_id}/stop", post(stop_run))
            .route("/runs/{run_id}/tools/{tool_name}", post(invoke_tool))
            .route("/health", get(health_check))
            .layer(TimeoutLayer::new(timeout))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve on `listener` until `shutdown` resolves, then drain in-flight
    /// requests.
    pub async fn serve<F>(listener: TcpListener, state: ApiState, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Run API listening on {}", addr);
        }
        axum::serve(listener, Self::router(state))
            .with_graceful_shutdown(shutdown)
            .await
    }
}

impl IntoResponse for RunError {
    fn into_response(self) -> Response {
        match self {
            RunError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid_request", "message": message })),
            )
                .into_response(),
            RunError::PolicyDenied(denial) => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "policy_denied",
                    "denial_reason": denial.reason,
                    "policy_evidence": denial.evidence,
                })),
            )
                .into_response(),
            RunError::NotFound { .. } => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found" })),
            )
                .into_response(),
            RunError::ToolForbidden { tool_name, .. } => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "tool_not_allowed", "tool_name": tool_name })),
            )
                .into_response(),
            RunError::UpstreamUnavailable { reason } => {
                tracing::warn!(%reason, "Upstream unavailable");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "error": "upstream_unavailable" })),
                )
                    .into_response()
            }
            RunError::Internal { reason } => {
                tracing::error!(%reason, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal_error" })),
                )
                    .into_response()
            }
        }
    }
}

// -- Handlers --

async fn health_check() -> &'static str {
    "ok"
}

async fn create_run(
    State(state): State<ApiState>,
    Json(request): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), RunError> {
    let response = state.orchestrator.create_run(request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunView>, RunError> {
    Ok(Json(state.orchestrator.get_run(&run_id).await?))
}

async fn get_logs(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunLogs>, RunError> {
    Ok(Json(state.orchestrator.get_logs(&run_id).await?))
}

async fn stop_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, RunError> {
    state.orchestrator.stop_run(&run_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn invoke_tool(
    State(state): State<ApiState>,
    Path((run_id, tool_name)): Path<(String, String)>,
    Json(request): Json<ToolInvokeRequest>,
) -> Result<Json<ToolInvocation>, RunError> {
    let result = state
        .orchestrator
        .invoke_tool(&run_id, &tool_name, request.input)
        .await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    use super::*;
    use crate::config::{PolicyConfig, RunnerConfig};
    use crate::policy::PolicyEnforcer;
    use crate::testing::{RecordingAuditSink, StubPlatform, StubVerifier};

    const DIGEST: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn test_state() -> (ApiState, Arc<StubPlatform>) {
        let policy = PolicyConfig {
            allowlisted_registries: vec!["ghcr.io".to_string()],
            cosign_key_path: Some(PathBuf::from("/keys/cosign.pub")),
            ..PolicyConfig::default()
        };
        let platform = Arc::new(StubPlatform::new());
        let orchestrator = RunOrchestrator::new(
            RunnerConfig::default(),
            PolicyEnforcer::new(policy, Arc::new(StubVerifier::digest(DIGEST))),
            platform.clone(),
            Arc::new(RecordingAuditSink::new()),
        )
        .unwrap();
        let state = ApiState {
            orchestrator: Arc::new(orchestrator),
            request_timeout: Duration::from_secs(5),
        };
        (state, platform)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(router: &Router, body: Value) -> Response {
        router.clone().oneshot(post_json("/runs", body)).await.unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (state, _) = test_state();
        let resp = RunApi::router(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_run_returns_created() {
        let (state, _) = test_state();
        let router = RunApi::router(state);

        let resp = create(
            &router,
            json!({"image_ref": "ghcr.io/acme/tool:1", "network_policy_profile": "deny-all"}),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["image_digest"], DIGEST);
        assert!(body["sandbox_name"].as_str().unwrap().starts_with("run-"));
        assert_eq!(body["policy_evidence"]["signature_verified"], true);
    }

    #[tokio::test]
    async fn validation_error_is_bad_request() {
        let (state, _) = test_state();
        let router = RunApi::router(state);

        let resp = create(
            &router,
            json!({"image_ref": "ghcr.io/acme/tool:1", "network_policy_profile": "deny-all", "timeout_seconds": -1}),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let (state, platform) = test_state();
        let router = RunApi::router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/runs")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();

        assert!(resp.status().is_client_error());
        assert!(platform.created_specs().is_empty());
    }

    #[tokio::test]
    async fn policy_denial_is_forbidden_with_evidence() {
        let (state, _) = test_state();
        let router = RunApi::router(state);

        let resp = create(
            &router,
            json!({"image_ref": "evil.example.com/bad:latest", "network_policy_profile": "deny-all"}),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "policy_denied");
        assert_eq!(body["denial_reason"], "registry_not_allowlisted");
        assert_eq!(body["policy_evidence"]["registry_allowed"], false);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let (state, _) = test_state();
        let router = RunApi::router(state);

        for req in [
            get("/runs/missing"),
            get("/runs/missing/logs"),
            post_json("/runs/missing/stop", json!({})),
            post_json("/runs/missing/tools/search", json!({"input": {}})),
        ] {
            let resp = router.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn run_lifecycle_over_http() {
        let (state, platform) = test_state();
        let router = RunApi::router(state);

        let resp = create(
            &router,
            json!({
                "image_ref": "ghcr.io/acme/tool:1",
                "network_policy_profile": "dns-only",
                "allowed_tools": ["search"]
            }),
        )
        .await;
        let run_id = body_json(resp).await["run_id"]
            .as_str()
            .unwrap()
            .to_string();
        let sandbox_id = format!("sbx-run-{run_id}");
        platform.set_status(&sandbox_id, "Running", "");
        platform.set_logs(&sandbox_id, "booted\n");

        let resp = router
            .clone()
            .oneshot(get(&format!("/runs/{run_id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let view = body_json(resp).await;
        assert_eq!(view["status"], "running");
        assert_eq!(view["allowed_tools"], json!(["search"]));

        let resp = router
            .clone()
            .oneshot(get(&format!("/runs/{run_id}/logs")))
            .await
            .unwrap();
        assert_eq!(
            body_json(resp).await,
            json!({"run_id": run_id, "stdout": "booted\n", "stderr": ""})
        );

        let resp = router
            .clone()
            .oneshot(post_json(
                &format!("/runs/{run_id}/tools/exec"),
                json!({"input": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(resp).await["error"], "tool_not_allowed");

        let resp = router
            .clone()
            .oneshot(post_json(&format!("/runs/{run_id}/stop"), json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        platform.fail_status(true);
        let resp = router
            .clone()
            .oneshot(get(&format!("/runs/{run_id}")))
            .await
            .unwrap();
        let view = body_json(resp).await;
        assert_eq!(view["status"], "stopped");
        assert_eq!(view["stopped_by_operator"], true);
        assert!(view.get("finished_at").is_some());
    }

    #[tokio::test]
    async fn upstream_failure_hides_detail() {
        let (state, platform) = test_state();
        let router = RunApi::router(state);

        let resp = create(
            &router,
            json!({"image_ref": "ghcr.io/acme/tool:1", "network_policy_profile": "deny-all"}),
        )
        .await;
        let run_id = body_json(resp).await["run_id"]
            .as_str()
            .unwrap()
            .to_string();
        platform.fail_logs(true);

        let resp = router
            .oneshot(get(&format!("/runs/{run_id}/logs")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            body_json(resp).await,
            json!({"error": "upstream_unavailable"})
        );
    }
}
