//! Kubernetes core API over plain REST.
//!
//! Only the handful of calls the provisioner makes are implemented. Client
//! settings come from a kubeconfig file or, failing that, the in-cluster
//! service account.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::cluster::{
    http_node_port, summarize_service, ClusterApi, ClusterError, ClusterResult, ServiceSummary,
};
use super::ProvisionerConfig;

const API_TIMEOUT: Duration = Duration::from_secs(15);
const KUBECONFIG_POLL: Duration = Duration::from_secs(2);
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Everything needed to build an authenticated API client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ClientSettings {
    pub server: String,
    pub ca_pem: Option<Vec<u8>>,
    pub token: Option<String>,
    /// Client certificate followed by its private key, PEM encoded.
    pub identity_pem: Option<Vec<u8>>,
    pub insecure: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key_data: Option<String>,
    #[serde(default)]
    client_certificate: Option<PathBuf>,
    #[serde(default)]
    client_key: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

fn decode(field: &str, data: &str) -> ClusterResult<Vec<u8>> {
    BASE64
        .decode(data.trim())
        .map_err(|e| ClusterError::config(format!("invalid base64 in {field}: {e}")))
}

fn read(field: &str, path: &Path) -> ClusterResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| ClusterError::config(format!("cannot read {field} {}: {e}", path.display())))
}

/// Resolves the current context of a kubeconfig document.
pub(crate) fn parse_kubeconfig(yaml: &str) -> ClusterResult<ClientSettings> {
    let kubeconfig: Kubeconfig = serde_yaml::from_str(yaml)
        .map_err(|e| ClusterError::config(format!("invalid kubeconfig: {e}")))?;

    let context = match &kubeconfig.current_context {
        Some(name) => kubeconfig.contexts.iter().find(|c| &c.name == name),
        None => kubeconfig.contexts.first(),
    };

    let cluster = match context {
        Some(ctx) => kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == ctx.context.cluster),
        None => kubeconfig.clusters.first(),
    }
    .ok_or_else(|| ClusterError::config("kubeconfig has no usable cluster"))?;

    let user = match context.and_then(|ctx| ctx.context.user.as_ref()) {
        Some(name) => kubeconfig.users.iter().find(|u| &u.name == name),
        None => kubeconfig.users.first(),
    };

    let entry = &cluster.cluster;
    let ca_pem = match (&entry.certificate_authority_data, &entry.certificate_authority) {
        (Some(data), _) => Some(decode("certificate-authority-data", data)?),
        (None, Some(path)) => Some(read("certificate-authority", path)?),
        (None, None) => None,
    };

    let mut settings = ClientSettings {
        server: entry.server.trim_end_matches('/').to_string(),
        ca_pem,
        insecure: entry.insecure_skip_tls_verify,
        ..ClientSettings::default()
    };

    if let Some(user) = user.map(|u| &u.user) {
        settings.token.clone_from(&user.token);
        let cert = match (&user.client_certificate_data, &user.client_certificate) {
            (Some(data), _) => Some(decode("client-certificate-data", data)?),
            (None, Some(path)) => Some(read("client-certificate", path)?),
            (None, None) => None,
        };
        let key = match (&user.client_key_data, &user.client_key) {
            (Some(data), _) => Some(decode("client-key-data", data)?),
            (None, Some(path)) => Some(read("client-key", path)?),
            (None, None) => None,
        };
        if let (Some(mut cert), Some(key)) = (cert, key) {
            cert.push(b'\n');
            cert.extend_from_slice(&key);
            settings.identity_pem = Some(cert);
        }
    }

    Ok(settings)
}

/// Service-account settings when running inside a cluster.
fn in_cluster_settings() -> ClusterResult<ClientSettings> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| ClusterError::config("KUBERNETES_SERVICE_HOST is not set"))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
    let dir = Path::new(SERVICE_ACCOUNT_DIR);
    let token = String::from_utf8_lossy(&read("service account token", &dir.join("token"))?)
        .trim()
        .to_string();
    let ca_pem = read("service account CA", &dir.join("ca.crt"))?;

    Ok(ClientSettings {
        server: format!("https://{host}:{port}"),
        ca_pem: Some(ca_pem),
        token: Some(token),
        identity_pem: None,
        insecure: false,
    })
}

/// Waits for the kubeconfig file to appear.
///
/// Returns `true` once it is a regular file and `false` if it never showed
/// up, in which case the caller falls back to in-cluster config. A
/// directory at the path is an immediate error.
pub(crate) async fn wait_for_kubeconfig(path: &Path, timeout: Duration) -> ClusterResult<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if path.exists() {
            if path.is_file() {
                info!(path = %path.display(), "Found kubeconfig file");
                return Ok(true);
            }
            if path.is_dir() {
                return Err(ClusterError::config(format!(
                    "Kubeconfig path is a directory. Please mount a kubeconfig file at {}.",
                    path.display()
                )));
            }
            return Err(ClusterError::config(format!(
                "Kubeconfig path exists but is not a regular file: {}",
                path.display()
            )));
        }
        if Instant::now() >= deadline {
            warn!(
                path = %path.display(),
                timeout_secs = timeout.as_secs(),
                "Kubeconfig not found; will attempt in-cluster Kubernetes config"
            );
            return Ok(false);
        }
        info!(path = %path.display(), "Waiting for kubeconfig");
        tokio::time::sleep(KUBECONFIG_POLL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

/// Resolves client settings from the provisioner configuration.
pub(crate) fn resolve_settings(config: &ProvisionerConfig) -> ClusterResult<ClientSettings> {
    let path = &config.kubeconfig_path;
    let mut settings = if path.exists() {
        if path.is_dir() {
            return Err(ClusterError::config(format!(
                "KUBECONFIG_PATH points to a directory, expected a file: {}",
                path.display()
            )));
        }
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::config(format!("Failed to load kubeconfig from {}: {e}", path.display()))
        })?;
        let settings = parse_kubeconfig(&yaml)?;
        info!(path = %path.display(), "Loaded kubeconfig");
        settings
    } else {
        warn!(path = %path.display(), "Kubeconfig not found; trying in-cluster config");
        in_cluster_settings().map_err(|e| {
            ClusterError::config(format!(
                "No kubeconfig at {}, and in-cluster config is unavailable: {e}",
                path.display()
            ))
        })?
    };

    // Local clusters reached through a rewritten address rarely have a
    // certificate valid for it.
    if let Some(server) = &config.api_server {
        settings.server = server.trim_end_matches('/').to_string();
        settings.insecure = true;
    }
    Ok(settings)
}

/// Kubernetes core/v1 client scoped to one namespace.
pub(crate) struct KubeClient {
    server: String,
    namespace: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl KubeClient {
    pub fn new(settings: ClientSettings, namespace: &str) -> ClusterResult<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(ca) = &settings.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca)
                .map_err(|e| ClusterError::config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(identity) = &settings.identity_pem {
            let identity = reqwest::Identity::from_pem(identity)
                .map_err(|e| ClusterError::config(format!("invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }
        if settings.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| ClusterError::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            server: settings.server,
            namespace: namespace.to_string(),
            token: settings.token,
            client,
        })
    }

    /// Builds a client from the provisioner configuration.
    pub fn connect(config: &ProvisionerConfig) -> ClusterResult<Self> {
        let settings = resolve_settings(config)?;
        info!(server = %settings.server, namespace = %config.namespace, "Connecting to Kubernetes");
        Self::new(settings, &config.namespace)
    }

    fn url(&self, resource: &str, name: Option<&str>) -> String {
        let base = format!(
            "{}/api/v1/namespaces/{}/{resource}",
            self.server, self.namespace
        );
        match name {
            Some(name) => format!("{base}/{name}"),
            None => base,
        }
    }

    async fn send(&self, request: RequestBuilder, kind: &'static str, name: &str) -> ClusterResult<Value> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Err(ClusterError::not_found(kind, name)),
            StatusCode::CONFLICT => Err(ClusterError::already_exists(kind, name)),
            s if s.is_success() => response
                .json::<Value>()
                .await
                .map_err(|e| ClusterError::Transport(format!("invalid API response: {e}"))),
            s => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                Err(ClusterError::Api {
                    status: s.as_u16(),
                    message: body["message"]
                        .as_str()
                        .or_else(|| s.canonical_reason())
                        .unwrap_or("request failed")
                        .to_string(),
                })
            }
        }
    }
}

fn manifest_name(manifest: &Value) -> &str {
    manifest["metadata"]["name"].as_str().unwrap_or_default()
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn ensure_namespace(&self) -> ClusterResult<()> {
        let url = format!("{}/api/v1/namespaces/{}", self.server, self.namespace);
        match self.send(self.client.get(url), "namespace", &self.namespace).await {
            Ok(_) => {
                info!(namespace = %self.namespace, "Namespace already exists");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                let body = json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": {
                        "name": self.namespace,
                        "labels": {
                            "app.kubernetes.io/name": "burrow",
                            "app.kubernetes.io/component": "sandbox",
                        },
                    },
                });
                let url = format!("{}/api/v1/namespaces", self.server);
                match self.send(self.client.post(url).json(&body), "namespace", &self.namespace).await {
                    Ok(_) => {
                        info!(namespace = %self.namespace, "Created namespace");
                        Ok(())
                    }
                    Err(e) if e.is_already_exists() => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn create_pod(&self, manifest: &Value) -> ClusterResult<()> {
        let request = self.client.post(self.url("pods", None)).json(manifest);
        self.send(request, "pod", manifest_name(manifest)).await.map(|_| ())
    }

    async fn create_service(&self, manifest: &Value) -> ClusterResult<()> {
        let request = self.client.post(self.url("services", None)).json(manifest);
        self.send(request, "service", manifest_name(manifest)).await.map(|_| ())
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        let request = self.client.delete(self.url("pods", Some(name)));
        self.send(request, "pod", name).await.map(|_| ())
    }

    async fn delete_service(&self, name: &str) -> ClusterResult<()> {
        let request = self.client.delete(self.url("services", Some(name)));
        self.send(request, "service", name).await.map(|_| ())
    }

    async fn pod_phase(&self, name: &str) -> ClusterResult<Option<String>> {
        let pod = self.send(self.client.get(self.url("pods", Some(name))), "pod", name).await?;
        Ok(pod["status"]["phase"].as_str().map(str::to_string))
    }

    async fn service_node_port(&self, name: &str) -> ClusterResult<Option<u16>> {
        let service = self
            .send(self.client.get(self.url("services", Some(name))), "service", name)
            .await?;
        Ok(http_node_port(&service))
    }

    async fn list_services(&self, label_selector: &str) -> ClusterResult<Vec<ServiceSummary>> {
        let request = self
            .client
            .get(self.url("services", None))
            .query(&[("labelSelector", label_selector)]);
        let list = self.send(request, "service", "list").await?;
        Ok(list["items"]
            .as_array()
            .map(|items| items.iter().map(summarize_service).collect())
            .unwrap_or_default())
    }
}
