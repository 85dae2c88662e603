//! Sandboxes provisioned as Kubernetes Pods by the provisioner service.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::managed::{BackendSandbox, SandboxBackend};
use super::{SandboxError, SandboxResult, SandboxStatus};
use crate::config::BackendKind;
use crate::provisioner::{CreateSandboxRequest, SandboxDescriptor};

const CREATE_TIMEOUT: Duration = Duration::from_secs(30);
const GET_TIMEOUT: Duration = Duration::from_secs(10);
const DELETE_TIMEOUT: Duration = Duration::from_secs(15);

/// Thin HTTP client for the provisioner's `/api/sandboxes` routes.
pub(crate) struct ProvisionedBackend {
    base_url: String,
    client: reqwest::Client,
}

impl ProvisionedBackend {
    pub fn new(provisioner_url: &str) -> SandboxResult<Self> {
        let base_url = provisioner_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(SandboxError::provisioning(format!(
                "invalid provisioner URL: {provisioner_url}"
            )));
        }
        info!(provisioner_url = %base_url, "Using provisioned sandbox backend");
        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
        })
    }

    fn sandbox_url(&self, sandbox_id: &str) -> String {
        format!("{}/api/sandboxes/{sandbox_id}", self.base_url)
    }

    /// `GET /api/sandboxes/{id}`; `None` when the provisioner reports 404.
    async fn fetch(&self, sandbox_id: &str) -> SandboxResult<Option<SandboxDescriptor>> {
        let response = self
            .client
            .get(self.sandbox_url(sandbox_id))
            .timeout(GET_TIMEOUT)
            .send()
            .await
            .map_err(|e| SandboxError::provisioning(format!("provisioner unreachable: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<SandboxDescriptor>()
                .await
                .map(Some)
                .map_err(|e| SandboxError::provisioning(format!("invalid provisioner response: {e}"))),
            status => Err(SandboxError::provisioning(format!(
                "provisioner returned {status}: {}",
                response.text().await.unwrap_or_default()
            ))),
        }
    }
}

#[async_trait]
impl SandboxBackend for ProvisionedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Provisioned
    }

    async fn create(&self, sandbox_id: &str, thread_id: &str) -> SandboxResult<BackendSandbox> {
        let request = CreateSandboxRequest {
            sandbox_id: sandbox_id.to_string(),
            thread_id: thread_id.to_string(),
        };
        let response = self
            .client
            .post(format!("{}/api/sandboxes", self.base_url))
            .timeout(CREATE_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| SandboxError::provisioning(format!("provisioner create failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::provisioning(format!(
                "provisioner create returned {status}: {body}"
            )));
        }

        let descriptor: SandboxDescriptor = response
            .json()
            .await
            .map_err(|e| SandboxError::provisioning(format!("invalid provisioner response: {e}")))?;
        info!(
            sandbox_id,
            sandbox_url = %descriptor.sandbox_url,
            status = %descriptor.status,
            "Provisioner created sandbox"
        );
        Ok(BackendSandbox {
            endpoint: descriptor.sandbox_url,
            status: descriptor.status,
        })
    }

    /// Only a sandbox whose Pod is still alive is adopted. A dead or missing
    /// Pod goes back through `create`, which recreates it.
    async fn discover(&self, sandbox_id: &str) -> SandboxResult<Option<BackendSandbox>> {
        let Some(descriptor) = self.fetch(sandbox_id).await? else {
            return Ok(None);
        };
        if matches!(descriptor.status, SandboxStatus::NotFound | SandboxStatus::Failed) {
            debug!(sandbox_id, status = %descriptor.status, "Not adopting dead sandbox");
            return Ok(None);
        }
        Ok(Some(BackendSandbox {
            endpoint: descriptor.sandbox_url,
            status: descriptor.status,
        }))
    }

    async fn status(&self, sandbox_id: &str) -> SandboxStatus {
        match self.fetch(sandbox_id).await {
            Ok(Some(descriptor)) => descriptor.status,
            Ok(None) => SandboxStatus::NotFound,
            Err(e) => {
                warn!(sandbox_id, error = %e, "Sandbox status unavailable");
                SandboxStatus::Unknown
            }
        }
    }

    async fn destroy(&self, sandbox_id: &str) -> SandboxResult<()> {
        let response = self
            .client
            .delete(self.sandbox_url(sandbox_id))
            .timeout(DELETE_TIMEOUT)
            .send()
            .await
            .map_err(|e| SandboxError::provisioning(format!("provisioner delete failed: {e}")))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(sandbox_id, "Provisioner destroyed sandbox");
            Ok(())
        } else {
            Err(SandboxError::provisioning(format!(
                "provisioner delete returned {status}: {}",
                response.text().await.unwrap_or_default()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_rejects_non_http_url() {
        assert!(ProvisionedBackend::new("provisioner:8002").is_err());
        assert!(ProvisionedBackend::new("http://provisioner:8002/").is_ok());
    }

    #[tokio::test]
    async fn test_create_posts_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sandboxes"))
            .and(body_json(json!({ "sandbox_id": "ab12cd34", "thread_id": "t1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sandbox_id": "ab12cd34",
                "sandbox_url": "http://node:30001",
                "status": "Pending"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = ProvisionedBackend::new(&server.uri()).unwrap();
        let created = backend.create("ab12cd34", "t1").await.unwrap();
        assert_eq!(created.endpoint, "http://node:30001");
        assert_eq!(created.status, SandboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_server_error_is_unknown_provisioning_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sandboxes"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({ "detail": "Pod creation failed" })),
            )
            .mount(&server)
            .await;

        let backend = ProvisionedBackend::new(&server.uri()).unwrap();
        let err = backend.create("ab12cd34", "t1").await.unwrap_err();
        assert!(err.is_provisioning());
        assert_eq!(err.status(), Some(SandboxStatus::Unknown));
        assert!(err.to_string().contains("Pod creation failed"));
    }

    #[tokio::test]
    async fn test_status_and_discover() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/sandboxes/live0001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sandbox_id": "live0001",
                "sandbox_url": "http://node:30002",
                "status": "Running"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/sandboxes/gone0001"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "detail": "not found" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/sandboxes/flaky001"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let backend = ProvisionedBackend::new(&server.uri()).unwrap();
        assert_eq!(backend.status("live0001").await, SandboxStatus::Running);
        assert_eq!(backend.status("gone0001").await, SandboxStatus::NotFound);
        assert_eq!(backend.status("flaky001").await, SandboxStatus::Unknown);

        assert_eq!(
            backend.discover("live0001").await.unwrap().unwrap().endpoint,
            "http://node:30002"
        );
        assert!(backend.discover("gone0001").await.unwrap().is_none());
        assert!(backend.discover("flaky001").await.is_err());
    }

    #[tokio::test]
    async fn test_discover_skips_dead_pods() {
        let server = MockServer::start().await;
        for (id, status) in [("nopod001", "NotFound"), ("dead0001", "Failed"), ("boot0001", "Pending")] {
            Mock::given(method("GET"))
                .and(path(format!("/api/sandboxes/{id}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "sandbox_id": id,
                    "sandbox_url": "http://node:30003",
                    "status": status
                })))
                .mount(&server)
                .await;
        }

        let backend = ProvisionedBackend::new(&server.uri()).unwrap();
        assert!(backend.discover("nopod001").await.unwrap().is_none());
        assert!(backend.discover("dead0001").await.unwrap().is_none());
        let pending = backend.discover("boot0001").await.unwrap().unwrap();
        assert_eq!(pending.status, SandboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_unreachable_provisioner_is_unknown() {
        let backend = ProvisionedBackend::new("http://127.0.0.1:1").unwrap();
        assert_eq!(backend.status("ab12cd34").await, SandboxStatus::Unknown);
        let err = backend.create("ab12cd34", "t1").await.unwrap_err();
        assert_eq!(err.status(), Some(SandboxStatus::Unknown));
    }

    #[tokio::test]
    async fn test_destroy_absorbs_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/sandboxes/gone0001"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/sandboxes/stuck001"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(json!({ "detail": "Partial cleanup: pod: Forbidden" })),
            )
            .mount(&server)
            .await;

        let backend = ProvisionedBackend::new(&server.uri()).unwrap();
        backend.destroy("gone0001").await.unwrap();
        assert!(backend.destroy("stuck001").await.is_err());
    }
}
