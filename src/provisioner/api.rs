//! HTTP routes of the provisioner.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::cluster::{
    build_pod, build_service, pod_name, service_name, ClusterApi, ClusterError, APP_LABEL,
};
use super::{CreateSandboxRequest, ProvisionerConfig, SandboxDescriptor};
use crate::paths::validate_thread_id;
use crate::sandbox::SandboxStatus;

const NODE_PORT_ATTEMPTS: usize = 20;
const NODE_PORT_POLL: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct AppState {
    cluster: Arc<dyn ClusterApi>,
    config: Arc<ProvisionerConfig>,
}

/// Error response with a `{"detail": ...}` body.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }

    /// Cluster failure with context. An unreachable API is 503.
    fn cluster(context: &str, err: &ClusterError) -> Self {
        let status = match err {
            ClusterError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, format!("{context}: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, detail = %self.detail, "Request failed");
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

#[derive(Serialize)]
struct SandboxList {
    sandboxes: Vec<SandboxDescriptor>,
    count: usize,
}

/// Sandbox ids become Kubernetes object names.
fn validate_sandbox_id(sandbox_id: &str) -> Result<(), ApiError> {
    let valid = !sandbox_id.is_empty()
        && sandbox_id.len() <= 48
        && sandbox_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !sandbox_id.starts_with('-')
        && !sandbox_id.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid sandbox_id '{sandbox_id}'"),
        ))
    }
}

impl AppState {
    /// NodePort of the sandbox's Service; `None` if it has none or is absent.
    async fn node_port(&self, sandbox_id: &str) -> Result<Option<u16>, ApiError> {
        match self.cluster.service_node_port(&service_name(sandbox_id)).await {
            Ok(port) => Ok(port),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(ApiError::cluster("Failed to read service", &e)),
        }
    }

    async fn status(&self, sandbox_id: &str) -> SandboxStatus {
        match self.cluster.pod_phase(&pod_name(sandbox_id)).await {
            Ok(phase) => SandboxStatus::from_phase(phase.as_deref()),
            Err(e) if e.is_not_found() => SandboxStatus::NotFound,
            Err(e) => {
                warn!(sandbox_id, error = %e, "Pod phase unavailable");
                SandboxStatus::Unknown
            }
        }
    }

    async fn descriptor(&self, sandbox_id: &str, node_port: u16) -> SandboxDescriptor {
        SandboxDescriptor {
            sandbox_id: sandbox_id.to_string(),
            sandbox_url: self.config.sandbox_url(node_port),
            status: self.status(sandbox_id).await,
        }
    }
}

/// Builds the provisioner's router.
pub(crate) fn router(cluster: Arc<dyn ClusterApi>, config: ProvisionerConfig) -> Router {
    let state = AppState {
        cluster,
        config: Arc::new(config),
    };
    Router::new()
        .route("/health", get(health))
        .route("/api/sandboxes", get(list_sandboxes).post(create_sandbox))
        .route(
            "/api/sandboxes/{sandbox_id}",
            get(get_sandbox).delete(destroy_sandbox),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_sandbox(
    State(state): State<AppState>,
    Json(request): Json<CreateSandboxRequest>,
) -> Result<Json<SandboxDescriptor>, ApiError> {
    let CreateSandboxRequest {
        sandbox_id,
        thread_id,
    } = request;
    validate_sandbox_id(&sandbox_id)?;
    validate_thread_id(&thread_id)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    info!(sandbox_id = %sandbox_id, thread_id = %thread_id, "Create sandbox requested");

    if let Some(port) = state.node_port(&sandbox_id).await? {
        let status = state.status(&sandbox_id).await;
        if status != SandboxStatus::NotFound {
            debug!(sandbox_id = %sandbox_id, node_port = port, "Sandbox already exists");
            return Ok(Json(SandboxDescriptor {
                sandbox_url: state.config.sandbox_url(port),
                sandbox_id,
                status,
            }));
        }
        warn!(sandbox_id = %sandbox_id, "Service exists without its pod, recreating pod");
    }

    let pod = build_pod(&state.config, &sandbox_id, &thread_id);
    match state.cluster.create_pod(&pod).await {
        Ok(()) => info!(pod = %pod_name(&sandbox_id), "Created pod"),
        Err(e) if e.is_already_exists() => debug!(pod = %pod_name(&sandbox_id), "Pod already exists"),
        Err(e) => return Err(ApiError::cluster("Pod creation failed", &e)),
    }

    let service = build_service(&state.config, &sandbox_id);
    match state.cluster.create_service(&service).await {
        Ok(()) => info!(service = %service_name(&sandbox_id), "Created service"),
        Err(e) if e.is_already_exists() => {
            debug!(service = %service_name(&sandbox_id), "Service already exists");
        }
        Err(e) => {
            if let Err(rollback) = state.cluster.delete_pod(&pod_name(&sandbox_id)).await {
                warn!(pod = %pod_name(&sandbox_id), error = %rollback, "Pod rollback failed");
            }
            return Err(ApiError::cluster("Service creation failed", &e));
        }
    }

    for attempt in 1..=NODE_PORT_ATTEMPTS {
        if let Some(port) = state.node_port(&sandbox_id).await? {
            info!(sandbox_id = %sandbox_id, node_port = port, "Sandbox provisioned");
            return Ok(Json(state.descriptor(&sandbox_id, port).await));
        }
        debug!(sandbox_id = %sandbox_id, attempt, "NodePort not allocated yet");
        tokio::time::sleep(NODE_PORT_POLL).await;
    }
    Err(ApiError::internal("NodePort was not allocated in time"))
}

async fn get_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<SandboxDescriptor>, ApiError> {
    validate_sandbox_id(&sandbox_id)?;
    match state.node_port(&sandbox_id).await? {
        Some(port) => Ok(Json(state.descriptor(&sandbox_id, port).await)),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Sandbox '{sandbox_id}' not found"),
        )),
    }
}

async fn destroy_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_sandbox_id(&sandbox_id)?;
    let mut errors = Vec::new();

    match state.cluster.delete_service(&service_name(&sandbox_id)).await {
        Ok(()) => info!(service = %service_name(&sandbox_id), "Deleted service"),
        Err(e) if e.is_not_found() => {}
        Err(e) => errors.push(format!("service: {e}")),
    }
    match state.cluster.delete_pod(&pod_name(&sandbox_id)).await {
        Ok(()) => info!(pod = %pod_name(&sandbox_id), "Deleted pod"),
        Err(e) if e.is_not_found() => {}
        Err(e) => errors.push(format!("pod: {e}")),
    }

    if !errors.is_empty() {
        return Err(ApiError::internal(format!(
            "Partial cleanup: {}",
            errors.join(", ")
        )));
    }
    Ok(Json(json!({ "ok": true, "sandbox_id": sandbox_id })))
}

async fn list_sandboxes(State(state): State<AppState>) -> Result<Json<SandboxList>, ApiError> {
    let services = state
        .cluster
        .list_services(&format!("app={APP_LABEL}"))
        .await
        .map_err(|e| ApiError::cluster("Failed to list services", &e))?;

    let mut sandboxes = Vec::new();
    for service in services {
        if let (Some(sandbox_id), Some(port)) = (service.sandbox_id, service.node_port) {
            sandboxes.push(state.descriptor(&sandbox_id, port).await);
        }
    }
    Ok(Json(SandboxList {
        count: sandboxes.len(),
        sandboxes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::paths::Paths;
    use crate::provisioner::InMemoryCluster;
    use crate::sandbox::{ManagedSandboxProvider, ProvisionedBackend, SandboxProvider};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn setup() -> (Arc<InMemoryCluster>, Router) {
        let cluster = Arc::new(InMemoryCluster::new());
        let config = ProvisionerConfig {
            node_host: "node".to_string(),
            ..ProvisionerConfig::default()
        };
        let app = router(cluster.clone(), config);
        (cluster, app)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn create_body(sandbox_id: &str) -> Option<Value> {
        Some(json!({ "sandbox_id": sandbox_id, "thread_id": "t1" }))
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = setup();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (cluster, app) = setup();

        let (status, first) = call(&app, Method::POST, "/api/sandboxes", create_body("ab12cd34")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["sandbox_id"], "ab12cd34");
        assert_eq!(first["sandbox_url"], "http://node:30000");
        assert_eq!(first["status"], "Running");

        let (status, second) = call(&app, Method::POST, "/api/sandboxes", create_body("ab12cd34")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, second);

        assert_eq!(cluster.pods_created(), 1);
        assert_eq!(cluster.services_created(), 1);
    }

    #[tokio::test]
    async fn test_create_recreates_missing_pod() {
        let (cluster, app) = setup();
        call(&app, Method::POST, "/api/sandboxes", create_body("abcd1234")).await;
        cluster.delete_pod("sandbox-abcd1234").await.unwrap();

        let (status, body) = call(&app, Method::POST, "/api/sandboxes", create_body("abcd1234")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sandbox_url"], "http://node:30000");
        assert_eq!(body["status"], "Running");
        assert_eq!(cluster.pods_created(), 2);
        assert_eq!(cluster.services_created(), 1);
        assert_eq!(cluster.pod_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (cluster, app) = setup();
        call(&app, Method::POST, "/api/sandboxes", create_body("ab12cd34")).await;

        for _ in 0..2 {
            let (status, body) = call(&app, Method::DELETE, "/api/sandboxes/ab12cd34", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({ "ok": true, "sandbox_id": "ab12cd34" }));
        }
        assert_eq!(cluster.pod_count().await, 0);
        assert_eq!(cluster.service_count().await, 0);

        let (status, body) = call(&app, Method::GET, "/api/sandboxes/ab12cd34", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "Sandbox 'ab12cd34' not found");
    }

    #[tokio::test]
    async fn test_service_failure_rolls_back_pod() {
        let (cluster, app) = setup();
        cluster.set_fail_service_create(true);

        let (status, body) = call(&app, Method::POST, "/api/sandboxes", create_body("ab12cd34")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().starts_with("Service creation failed"));
        assert_eq!(cluster.pods_created(), 1);
        assert_eq!(cluster.pod_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_server_error() {
        let (cluster, app) = setup();
        cluster.set_unreachable(true);

        let (status, _) = call(&app, Method::POST, "/api/sandboxes", create_body("ab12cd34")).await;
        assert!(status.is_server_error());
        let (status, _) = call(&app, Method::GET, "/api/sandboxes/ab12cd34", None).await;
        assert!(status.is_server_error());
        let (status, _) = call(&app, Method::GET, "/api/sandboxes", None).await;
        assert!(status.is_server_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_port_timeout() {
        let (cluster, app) = setup();
        cluster.set_allocate_node_ports(false);

        let (status, body) = call(&app, Method::POST, "/api/sandboxes", create_body("ab12cd34")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "NodePort was not allocated in time");
    }

    #[tokio::test]
    async fn test_phase_mapping() {
        let (cluster, app) = setup();
        call(&app, Method::POST, "/api/sandboxes", create_body("ab12cd34")).await;

        for (phase, expected) in [
            (Some("Pending"), "Pending"),
            (Some("Succeeded"), "Succeeded"),
            (Some("Failed"), "Failed"),
            (Some("Evicted"), "Unknown"),
            (None, "Unknown"),
        ] {
            cluster.set_phase("sandbox-ab12cd34", phase).await;
            let (_, body) = call(&app, Method::GET, "/api/sandboxes/ab12cd34", None).await;
            assert_eq!(body["status"], expected, "phase {phase:?}");
        }

        cluster.delete_pod("sandbox-ab12cd34").await.unwrap();
        let (status, body) = call(&app, Method::GET, "/api/sandboxes/ab12cd34", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "NotFound");
    }

    #[tokio::test]
    async fn test_list_sandboxes() {
        let (_, app) = setup();
        call(&app, Method::POST, "/api/sandboxes", create_body("aaaa0001")).await;
        call(&app, Method::POST, "/api/sandboxes", create_body("bbbb0002")).await;

        let (status, body) = call(&app, Method::GET, "/api/sandboxes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["sandboxes"][0]["sandbox_id"], "aaaa0001");
        assert_eq!(body["sandboxes"][1]["sandbox_url"], "http://node:30001");
    }

    #[tokio::test]
    async fn test_rejects_bad_ids() {
        let (cluster, app) = setup();
        let (status, _) = call(&app, Method::POST, "/api/sandboxes", create_body("Bad_Id")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let body = Some(json!({ "sandbox_id": "ab12cd34", "thread_id": "../etc" }));
        let (status, _) = call(&app, Method::POST, "/api/sandboxes", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(cluster.pods_created(), 0);
    }

    #[tokio::test]
    async fn test_provisioned_provider_against_live_service() {
        let (cluster, app) = setup();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let dir = tempdir().unwrap();
        let config = SandboxConfig {
            idle_timeout_secs: 0,
            ..SandboxConfig::default()
        };
        let backend = ProvisionedBackend::new(&format!("http://{addr}")).unwrap();
        let provider = ManagedSandboxProvider::new(backend, Paths::new(dir.path()), &config);

        let first = provider.acquire("t1").await.unwrap();
        let second = provider.acquire("t1").await.unwrap();
        assert_eq!(first.sandbox_id, second.sandbox_id);
        assert_eq!(first.endpoint.as_deref(), Some("http://node:30000"));
        assert_eq!(cluster.pods_created(), 1);
        assert_eq!(
            provider.get(&first.sandbox_id).await.unwrap(),
            SandboxStatus::Running
        );

        provider.release(&first.sandbox_id).await.unwrap();
        provider.release(&first.sandbox_id).await.unwrap();
        assert_eq!(
            provider.get(&first.sandbox_id).await.unwrap(),
            SandboxStatus::NotFound
        );
        assert_eq!(cluster.pod_count().await, 0);
    }
}
