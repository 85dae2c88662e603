//! Cluster access for the provisioner.
//!
//! [`ClusterApi`] is the narrow slice of the Kubernetes core API the
//! provisioner needs. Manifests are plain JSON so the REST client can send
//! them verbatim and the in-memory cluster can inspect them.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::ProvisionerConfig;

/// Label shared by every sandbox Pod and Service.
pub(crate) const APP_LABEL: &str = "burrow-sandbox";

/// Port the sandbox image serves its API on.
pub(crate) const SANDBOX_PORT: u16 = 8080;

/// Errors from cluster operations.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Kubernetes API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Kubernetes API unreachable: {0}")]
    Transport(String),

    #[error("Kubernetes client configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

pub(crate) type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// A sandbox Service as seen in a label-selected listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServiceSummary {
    pub sandbox_id: Option<String>,
    pub node_port: Option<u16>,
}

#[async_trait]
pub(crate) trait ClusterApi: Send + Sync {
    /// Creates the namespace if it is missing.
    async fn ensure_namespace(&self) -> ClusterResult<()>;

    async fn create_pod(&self, manifest: &Value) -> ClusterResult<()>;

    async fn create_service(&self, manifest: &Value) -> ClusterResult<()>;

    async fn delete_pod(&self, name: &str) -> ClusterResult<()>;

    async fn delete_service(&self, name: &str) -> ClusterResult<()>;

    /// Pod phase; `Ok(None)` when the Pod has no phase yet.
    async fn pod_phase(&self, name: &str) -> ClusterResult<Option<String>>;

    /// NodePort allocated for the Service's `http` port, if any yet.
    async fn service_node_port(&self, name: &str) -> ClusterResult<Option<u16>>;

    async fn list_services(&self, label_selector: &str) -> ClusterResult<Vec<ServiceSummary>>;
}

pub(crate) fn pod_name(sandbox_id: &str) -> String {
    format!("sandbox-{sandbox_id}")
}

pub(crate) fn service_name(sandbox_id: &str) -> String {
    format!("sandbox-{sandbox_id}-svc")
}

fn labels(sandbox_id: &str) -> Value {
    json!({
        "app": APP_LABEL,
        "sandbox-id": sandbox_id,
        "app.kubernetes.io/name": "burrow",
        "app.kubernetes.io/component": "sandbox",
    })
}

/// Pod running the sandbox image with skills and thread data mounted.
pub(crate) fn build_pod(config: &ProvisionerConfig, sandbox_id: &str, thread_id: &str) -> Value {
    let probe = |initial_delay: u32, period: u32| {
        json!({
            "httpGet": { "path": "/v1/sandbox", "port": SANDBOX_PORT },
            "initialDelaySeconds": initial_delay,
            "periodSeconds": period,
            "timeoutSeconds": 3,
            "failureThreshold": 3,
        })
    };

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name(sandbox_id),
            "namespace": config.namespace,
            "labels": labels(sandbox_id),
        },
        "spec": {
            "containers": [{
                "name": "sandbox",
                "image": config.sandbox_image,
                "imagePullPolicy": "IfNotPresent",
                "ports": [{ "name": "http", "containerPort": SANDBOX_PORT, "protocol": "TCP" }],
                "readinessProbe": probe(5, 5),
                "livenessProbe": probe(10, 10),
                "resources": {
                    "requests": { "cpu": "100m", "memory": "256Mi", "ephemeral-storage": "500Mi" },
                    "limits": { "cpu": "1000m", "memory": "1Gi", "ephemeral-storage": "500Mi" },
                },
                "volumeMounts": [
                    { "name": "skills", "mountPath": "/mnt/skills", "readOnly": true },
                    { "name": "user-data", "mountPath": "/mnt/user-data", "readOnly": false },
                ],
                "securityContext": { "privileged": false, "allowPrivilegeEscalation": true },
            }],
            "volumes": [
                {
                    "name": "skills",
                    "hostPath": { "path": config.skills_host_path, "type": "Directory" },
                },
                {
                    "name": "user-data",
                    "hostPath": {
                        "path": format!("{}/{thread_id}/user-data", config.threads_host_path.trim_end_matches('/')),
                        "type": "DirectoryOrCreate",
                    },
                },
            ],
            "restartPolicy": "Always",
        },
    })
}

/// NodePort Service selecting the sandbox Pod; the port is cluster-allocated.
pub(crate) fn build_service(config: &ProvisionerConfig, sandbox_id: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": service_name(sandbox_id),
            "namespace": config.namespace,
            "labels": labels(sandbox_id),
        },
        "spec": {
            "type": "NodePort",
            "ports": [{
                "name": "http",
                "port": SANDBOX_PORT,
                "targetPort": SANDBOX_PORT,
                "protocol": "TCP",
            }],
            "selector": { "sandbox-id": sandbox_id },
        },
    })
}

/// Reads the `http` NodePort out of a Service object.
pub(crate) fn http_node_port(service: &Value) -> Option<u16> {
    service["spec"]["ports"]
        .as_array()?
        .iter()
        .find(|p| p["name"] == "http")
        .and_then(|p| p["nodePort"].as_u64())
        .and_then(|p| u16::try_from(p).ok())
}

/// Summarises a Service object for listings.
pub(crate) fn summarize_service(service: &Value) -> ServiceSummary {
    ServiceSummary {
        sandbox_id: service["metadata"]["labels"]["sandbox-id"]
            .as_str()
            .map(str::to_string),
        node_port: http_node_port(service),
    }
}

/// True if the object's labels satisfy a `key=value[,key=value]` selector.
pub(crate) fn matches_selector(object: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => object["metadata"]["labels"][key.trim()] == value.trim(),
            None => false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProvisionerConfig {
        ProvisionerConfig {
            threads_host_path: "/data/threads/".to_string(),
            ..ProvisionerConfig::default()
        }
    }

    #[test]
    fn test_pod_manifest() {
        let pod = build_pod(&config(), "ab12cd34", "t1");
        assert_eq!(pod["metadata"]["name"], "sandbox-ab12cd34");
        assert_eq!(pod["metadata"]["labels"]["app"], APP_LABEL);
        assert_eq!(pod["metadata"]["labels"]["sandbox-id"], "ab12cd34");

        let container = &pod["spec"]["containers"][0];
        assert_eq!(container["imagePullPolicy"], "IfNotPresent");
        assert_eq!(container["readinessProbe"]["httpGet"]["path"], "/v1/sandbox");
        assert_eq!(container["resources"]["limits"]["memory"], "1Gi");

        let volumes = pod["spec"]["volumes"].as_array().unwrap();
        assert_eq!(volumes[0]["hostPath"]["type"], "Directory");
        assert_eq!(volumes[1]["hostPath"]["path"], "/data/threads/t1/user-data");
        assert_eq!(volumes[1]["hostPath"]["type"], "DirectoryOrCreate");
        assert_eq!(container["volumeMounts"][0]["readOnly"], true);
    }

    #[test]
    fn test_service_manifest() {
        let svc = build_service(&config(), "ab12cd34");
        assert_eq!(svc["metadata"]["name"], "sandbox-ab12cd34-svc");
        assert_eq!(svc["spec"]["type"], "NodePort");
        assert_eq!(svc["spec"]["selector"]["sandbox-id"], "ab12cd34");
        assert_eq!(http_node_port(&svc), None);
    }

    #[test]
    fn test_node_port_and_selector() {
        let mut svc = build_service(&config(), "ab12cd34");
        svc["spec"]["ports"][0]["nodePort"] = json!(31234);

        assert_eq!(http_node_port(&svc), Some(31234));
        assert_eq!(
            summarize_service(&svc),
            ServiceSummary {
                sandbox_id: Some("ab12cd34".to_string()),
                node_port: Some(31234),
            }
        );
        assert!(matches_selector(&svc, "app=burrow-sandbox"));
        assert!(matches_selector(&svc, "app=burrow-sandbox,sandbox-id=ab12cd34"));
        assert!(!matches_selector(&svc, "app=other"));
    }
}
