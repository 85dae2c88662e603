//! Provisioner service: owns `sandbox_id -> Pod + Service` in a cluster.
//!
//! The service is stateless beyond what the cluster records. Every route
//! derives the answer from live Pod and Service objects, so a restarted
//! provisioner picks up where the last one stopped.

mod api;
mod cluster;
mod kube;
mod memory;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub(crate) use api::router;
pub(crate) use cluster::ClusterApi;
pub(crate) use kube::KubeClient;
pub(crate) use memory::InMemoryCluster;

use crate::sandbox::SandboxStatus;

const KUBECONFIG_WAIT: Duration = Duration::from_secs(30);

/// Settings for the provisioner and the manifests it builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProvisionerConfig {
    pub namespace: String,
    pub sandbox_image: String,
    /// Host directory mounted read-only at `/mnt/skills`.
    pub skills_host_path: String,
    /// Host directory holding `{thread_id}/user-data` trees.
    pub threads_host_path: String,
    pub kubeconfig_path: PathBuf,
    /// Replaces the kubeconfig server address; disables TLS verification.
    pub api_server: Option<String>,
    /// Host name callers use to reach NodePorts.
    pub node_host: String,
    pub listen: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            namespace: "burrow".to_string(),
            sandbox_image: crate::config::DEFAULT_SANDBOX_IMAGE.to_string(),
            skills_host_path: "/skills".to_string(),
            threads_host_path: "/.burrow/threads".to_string(),
            kubeconfig_path: PathBuf::from("/root/.kube/config"),
            api_server: None,
            node_host: "host.docker.internal".to_string(),
            listen: "0.0.0.0:8002".to_string(),
        }
    }
}

impl ProvisionerConfig {
    pub fn sandbox_url(&self, node_port: u16) -> String {
        format!("http://{}:{node_port}", self.node_host)
    }
}

/// Body of `POST /api/sandboxes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CreateSandboxRequest {
    pub sandbox_id: String,
    pub thread_id: String,
}

/// What the provisioner reports for one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SandboxDescriptor {
    pub sandbox_id: String,
    pub sandbox_url: String,
    pub status: SandboxStatus,
}

/// Which cluster the provisioner talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub(crate) enum ClusterKind {
    /// Kubernetes API via kubeconfig or in-cluster service account
    #[default]
    Kubernetes,
    /// Process-local fake; nothing is actually scheduled
    Memory,
}

/// Connects to the cluster and serves the API until Ctrl-C.
pub(crate) async fn serve(config: ProvisionerConfig, kind: ClusterKind) -> Result<()> {
    let cluster: Arc<dyn ClusterApi> = match kind {
        ClusterKind::Kubernetes => {
            kube::wait_for_kubeconfig(&config.kubeconfig_path, KUBECONFIG_WAIT).await?;
            Arc::new(KubeClient::connect(&config)?)
        }
        ClusterKind::Memory => {
            warn!("Using in-memory cluster; sandbox URLs will not be reachable");
            Arc::new(InMemoryCluster::new())
        }
    };

    cluster
        .ensure_namespace()
        .await
        .with_context(|| format!("Failed to ensure namespace {}", config.namespace))?;

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(
        addr = %listener.local_addr()?,
        namespace = %config.namespace,
        node_host = %config.node_host,
        "Provisioner listening"
    );

    axum::serve(listener, router(cluster, config))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Provisioner shutting down");
        })
        .await
        .context("Provisioner server failed")
}
