//! `burrow provisioner`: runs the HTTP service that creates sandbox Pods.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use crate::provisioner::{self, ClusterKind, ProvisionerConfig};

/// Provisioner settings; each flag can also come from the environment.
#[derive(Args, Debug)]
pub struct ProvisionerArgs {
    /// Namespace holding sandbox Pods and Services
    #[arg(long, env = "K8S_NAMESPACE", default_value = "burrow")]
    namespace: String,

    /// Image each sandbox Pod runs
    #[arg(long, env = "SANDBOX_IMAGE")]
    sandbox_image: Option<String>,

    /// Host directory mounted read-only at /mnt/skills
    #[arg(long, env = "SKILLS_HOST_PATH", default_value = "/skills")]
    skills_host_path: String,

    /// Host directory holding per-thread user data
    #[arg(long, env = "THREADS_HOST_PATH", default_value = "/.burrow/threads")]
    threads_host_path: String,

    /// Kubeconfig used to reach the cluster
    #[arg(long, env = "KUBECONFIG_PATH", default_value = "/root/.kube/config")]
    kubeconfig: PathBuf,

    /// Overrides the API server address from the kubeconfig
    #[arg(long, env = "K8S_API_SERVER")]
    api_server: Option<String>,

    /// Host name callers use to reach sandbox NodePorts
    #[arg(long, env = "NODE_HOST", default_value = "host.docker.internal")]
    node_host: String,

    /// Address to listen on
    #[arg(long, env = "PROVISIONER_LISTEN", default_value = "0.0.0.0:8002")]
    listen: String,

    /// Cluster implementation to drive
    #[arg(long, value_enum, default_value_t = ClusterKind::Kubernetes)]
    cluster: ClusterKind,
}

impl ProvisionerArgs {
    fn into_config(self) -> (ProvisionerConfig, ClusterKind) {
        let defaults = ProvisionerConfig::default();
        let config = ProvisionerConfig {
            namespace: self.namespace,
            sandbox_image: self.sandbox_image.unwrap_or(defaults.sandbox_image),
            skills_host_path: self.skills_host_path,
            threads_host_path: self.threads_host_path,
            kubeconfig_path: self.kubeconfig,
            api_server: self.api_server.filter(|s| !s.is_empty()),
            node_host: self.node_host,
            listen: self.listen,
        };
        (config, self.cluster)
    }
}

pub(crate) async fn run(args: ProvisionerArgs) -> Result<()> {
    let (config, kind) = args.into_config();
    provisioner::serve(config, kind).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: ProvisionerArgs,
    }

    #[test]
    fn test_flags_build_config() {
        let harness = Harness::parse_from([
            "burrow",
            "--namespace",
            "sandboxes",
            "--api-server",
            "https://10.0.0.1:6443",
            "--node-host",
            "localhost",
            "--cluster",
            "memory",
        ]);
        let (config, kind) = harness.args.into_config();
        assert_eq!(config.namespace, "sandboxes");
        assert_eq!(config.api_server.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(config.sandbox_url(31000), "http://localhost:31000");
        assert_eq!(config.sandbox_image, ProvisionerConfig::default().sandbox_image);
        assert_eq!(kind, ClusterKind::Memory);
    }
}
