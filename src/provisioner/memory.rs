//! In-memory cluster for development and tests.
//!
//! Pods start `Running`, Services get a free NodePort from the default
//! 30000-32767 range, and objects behave like the API server for
//! create/delete conflicts.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use super::cluster::{
    http_node_port, matches_selector, summarize_service, ClusterApi, ClusterError, ClusterResult,
    ServiceSummary,
};

const NODE_PORT_START: u16 = 30000;
const NODE_PORT_END: u16 = 32767;

#[derive(Default)]
struct State {
    pods: BTreeMap<String, Value>,
    services: BTreeMap<String, Value>,
    next_node_port: u16,
}

#[derive(Default)]
pub(crate) struct InMemoryCluster {
    state: Mutex<State>,
    pods_created: AtomicUsize,
    services_created: AtomicUsize,
    unreachable: AtomicBool,
    fail_service_create: AtomicBool,
    allocate_node_ports: AtomicBool,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.allocate_node_ports.store(true, Ordering::SeqCst);
        cluster
    }

    /// Makes every call fail as if the API server were down.
    #[cfg(test)]
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Makes Service creation fail with a server error.
    #[cfg(test)]
    pub fn set_fail_service_create(&self, fail: bool) {
        self.fail_service_create.store(fail, Ordering::SeqCst);
    }

    /// Leaves new Services without a NodePort.
    #[cfg(test)]
    pub fn set_allocate_node_ports(&self, allocate: bool) {
        self.allocate_node_ports.store(allocate, Ordering::SeqCst);
    }

    /// Overrides a Pod's phase; `None` clears it.
    #[cfg(test)]
    pub async fn set_phase(&self, pod: &str, phase: Option<&str>) {
        if let Some(object) = self.state.lock().await.pods.get_mut(pod) {
            object["status"]["phase"] = phase.map_or(Value::Null, |p| json!(p));
        }
    }

    #[cfg(test)]
    pub fn pods_created(&self) -> usize {
        self.pods_created.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn services_created(&self) -> usize {
        self.services_created.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub async fn pod_count(&self) -> usize {
        self.state.lock().await.pods.len()
    }

    #[cfg(test)]
    pub async fn service_count(&self) -> usize {
        self.state.lock().await.services.len()
    }

    fn check_reachable(&self) -> ClusterResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(ClusterError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

impl State {
    /// Next unused NodePort, wrapping around the range.
    fn allocate_node_port(&mut self) -> ClusterResult<u16> {
        let in_use: HashSet<u16> = self.services.values().filter_map(http_node_port).collect();
        let span = NODE_PORT_END - NODE_PORT_START + 1;
        for offset in 0..span {
            let port = NODE_PORT_START + (self.next_node_port + offset) % span;
            if !in_use.contains(&port) {
                self.next_node_port = (port - NODE_PORT_START + 1) % span;
                return Ok(port);
            }
        }
        Err(ClusterError::Api {
            status: 422,
            message: format!("no free NodePort in {NODE_PORT_START}-{NODE_PORT_END}"),
        })
    }
}

fn object_name(manifest: &Value) -> ClusterResult<String> {
    manifest["metadata"]["name"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ClusterError::Api {
            status: 422,
            message: "metadata.name is required".to_string(),
        })
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn ensure_namespace(&self) -> ClusterResult<()> {
        self.check_reachable()?;
        debug!("In-memory cluster has no namespaces to create");
        Ok(())
    }

    async fn create_pod(&self, manifest: &Value) -> ClusterResult<()> {
        self.check_reachable()?;
        let name = object_name(manifest)?;
        let mut state = self.state.lock().await;
        if state.pods.contains_key(&name) {
            return Err(ClusterError::already_exists("pod", name));
        }
        let mut pod = manifest.clone();
        pod["status"] = json!({ "phase": "Running" });
        let total = self.pods_created.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(pod = %name, total, "Created pod");
        state.pods.insert(name, pod);
        Ok(())
    }

    async fn create_service(&self, manifest: &Value) -> ClusterResult<()> {
        self.check_reachable()?;
        if self.fail_service_create.load(Ordering::SeqCst) {
            return Err(ClusterError::Api {
                status: 500,
                message: "Internal error".to_string(),
            });
        }
        let name = object_name(manifest)?;
        let mut state = self.state.lock().await;
        if state.services.contains_key(&name) {
            return Err(ClusterError::already_exists("service", name));
        }
        let mut service = manifest.clone();
        if self.allocate_node_ports.load(Ordering::SeqCst) {
            let port = state.allocate_node_port()?;
            if let Some(ports) = service["spec"]["ports"].as_array_mut() {
                for p in ports.iter_mut().filter(|p| p["name"] == "http") {
                    p["nodePort"] = json!(port);
                }
            }
        }
        let total = self.services_created.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(service = %name, total, "Created service");
        state.services.insert(name, service);
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        self.check_reachable()?;
        match self.state.lock().await.pods.remove(name) {
            Some(_) => Ok(()),
            None => Err(ClusterError::not_found("pod", name)),
        }
    }

    async fn delete_service(&self, name: &str) -> ClusterResult<()> {
        self.check_reachable()?;
        match self.state.lock().await.services.remove(name) {
            Some(_) => Ok(()),
            None => Err(ClusterError::not_found("service", name)),
        }
    }

    async fn pod_phase(&self, name: &str) -> ClusterResult<Option<String>> {
        self.check_reachable()?;
        let state = self.state.lock().await;
        let pod = state
            .pods
            .get(name)
            .ok_or_else(|| ClusterError::not_found("pod", name))?;
        Ok(pod["status"]["phase"].as_str().map(str::to_string))
    }

    async fn service_node_port(&self, name: &str) -> ClusterResult<Option<u16>> {
        self.check_reachable()?;
        let state = self.state.lock().await;
        let service = state
            .services
            .get(name)
            .ok_or_else(|| ClusterError::not_found("service", name))?;
        Ok(http_node_port(service))
    }

    async fn list_services(&self, label_selector: &str) -> ClusterResult<Vec<ServiceSummary>> {
        self.check_reachable()?;
        let state = self.state.lock().await;
        Ok(state
            .services
            .values()
            .filter(|s| matches_selector(s, label_selector))
            .map(summarize_service)
            .collect())
    }
}
