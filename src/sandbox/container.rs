//! One long-lived container per sandbox, on Docker or Podman.
//!
//! The container runs the sandbox image with the thread's `user-data`
//! directory mounted at `/mnt/user-data` and the skills directory mounted
//! read-only at `/mnt/skills`. Its API port is published on a random
//! loopback port, which is read back from the container inspect.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::managed::{BackendSandbox, SandboxBackend};
use super::path::{SKILLS_ROOT, USER_DATA_ROOT};
use super::{SandboxError, SandboxResult, SandboxStatus};
use crate::config::{BackendKind, SandboxConfig};
use crate::paths::Paths;

/// Podman sockets probed when Docker is not available.
const PODMAN_SOCKETS: [&str; 2] = ["/run/podman/podman.sock", "/var/run/podman/podman.sock"];

/// Timeout for the readiness probe against a running container.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Container runtime the backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Runtime {
    Docker,
    Podman,
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Podman => write!(f, "podman"),
        }
    }
}

pub(crate) struct ContainerBackend {
    docker: Docker,
    runtime: Runtime,
    config: SandboxConfig,
    paths: Paths,
    skills_dir: PathBuf,
    probe: reqwest::Client,
}

impl ContainerBackend {
    /// Connects to the first reachable runtime: Docker, then Podman.
    pub async fn connect(config: &SandboxConfig, paths: Paths, skills_dir: PathBuf) -> SandboxResult<Self> {
        let (docker, runtime) = detect_runtime().await?;
        info!(%runtime, image = %config.image, "Using container sandbox backend");
        Ok(Self {
            docker,
            runtime,
            config: config.clone(),
            paths,
            skills_dir,
            probe: reqwest::Client::new(),
        })
    }

    fn container_name(&self, sandbox_id: &str) -> String {
        format!("{}-{sandbox_id}", self.config.container_prefix)
    }

    async fn inspect(&self, sandbox_id: &str) -> SandboxResult<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(&self.container_name(sandbox_id), None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(response)),
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(SandboxError::provisioning(format!(
                "{} inspect failed: {e}",
                self.runtime
            ))),
        }
    }

    /// Pulls the sandbox image unless the runtime already has it.
    async fn ensure_image(&self) -> SandboxResult<()> {
        let image = &self.config.image;
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_status(&e, 404) => {}
            Err(e) => {
                return Err(SandboxError::provisioning(format!(
                    "{} image inspect failed: {e}",
                    self.runtime
                )))
            }
        }

        info!(%image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: image.as_str(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(SandboxError::provisioning(format!(
                            "failed to pull {image}: {error}"
                        )));
                    }
                    if let Some(status) = progress.status {
                        debug!(%image, status = status.trim(), "pull");
                    }
                }
                Err(e) => {
                    return Err(SandboxError::provisioning(format!(
                        "failed to pull {image}: {e}"
                    )))
                }
            }
        }
        info!(%image, "Pulled sandbox image");
        Ok(())
    }

    fn endpoint(&self, response: &ContainerInspectResponse) -> SandboxResult<String> {
        let port = published_port(response, self.config.port).ok_or_else(|| {
            SandboxError::provisioning(format!(
                "container port {} is not published",
                self.config.port
            ))
        })?;
        Ok(format!("http://127.0.0.1:{port}"))
    }

    /// Running container whose API answers, or `Pending` while it boots.
    async fn probe(&self, response: &ContainerInspectResponse) -> SandboxStatus {
        let status = container_status(response);
        if status != SandboxStatus::Running {
            return status;
        }
        let Ok(endpoint) = self.endpoint(response) else {
            return SandboxStatus::Pending;
        };
        match self
            .probe
            .get(format!("{endpoint}/v1/sandbox"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => SandboxStatus::Running,
            _ => SandboxStatus::Pending,
        }
    }

    fn build_container_config(&self, sandbox_id: &str, thread_id: &str, user_data: &Path) -> SandboxResult<ContainerConfig<String>> {
        let mut binds = vec![format!("{}:{USER_DATA_ROOT}:rw", user_data.display())];

        if self.skills_dir.is_dir() {
            binds.push(format!("{}:{SKILLS_ROOT}:ro", self.skills_dir.display()));
        } else {
            debug!(skills_dir = %self.skills_dir.display(), "Skills directory missing, not mounting");
        }

        for mount in &self.config.mounts {
            let host_path = expand_path(&mount.host)?;
            let mode = if mount.readonly { "ro" } else { "rw" };
            binds.push(format!("{}:{}:{}", host_path, mount.container, mode));
        }

        let memory = parse_memory_limit(&self.config.resources.memory)?;
        let cpus = self.config.resources.cpus.parse::<f64>().unwrap_or(1.0);

        let container_port = format!("{}/tcp", self.config.port);
        let port_bindings = HashMap::from([(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(String::new()),
            }]),
        )]);

        let labels = HashMap::from([
            ("app".to_string(), "burrow-sandbox".to_string()),
            ("sandbox-id".to_string(), sandbox_id.to_string()),
            ("thread-id".to_string(), thread_id.to_string()),
        ]);

        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (cpus * 1_000_000_000.0) as i64;

        Ok(ContainerConfig {
            image: Some(self.config.image.clone()),
            env: Some(resolve_env(&self.config.environment)),
            labels: Some(labels),
            exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
            host_config: Some(HostConfig {
                binds: Some(binds),
                port_bindings: Some(port_bindings),
                memory: Some(memory),
                nano_cpus: Some(nano_cpus),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn create(&self, sandbox_id: &str, thread_id: &str) -> SandboxResult<BackendSandbox> {
        let name = self.container_name(sandbox_id);

        if self.inspect(sandbox_id).await?.is_none() {
            self.ensure_image().await?;
            let user_data = self.paths.ensure_thread_dirs(thread_id)?;
            let config = self.build_container_config(sandbox_id, thread_id, &user_data)?;

            debug!(container = %name, "Creating container");
            match self
                .docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: name.clone(),
                        platform: None,
                    }),
                    config,
                )
                .await
            {
                Ok(_) => {}
                // Another process won the race; adopt its container.
                Err(e) if is_status(&e, 409) => debug!(container = %name, "Container already exists"),
                Err(e) => {
                    return Err(SandboxError::provisioning(format!(
                        "failed to create container {name}: {e}"
                    )))
                }
            }
        }

        debug!(container = %name, "Starting container");
        match self.docker.start_container::<String>(&name, None).await {
            // 304: already running.
            Ok(()) => {}
            Err(e) if is_status(&e, 304) => {}
            Err(e) => {
                return Err(SandboxError::provisioning(format!(
                    "failed to start container {name}: {e}"
                )))
            }
        }

        let response = self
            .inspect(sandbox_id)
            .await?
            .ok_or_else(|| SandboxError::provisioning(format!("container {name} vanished after start")))?;
        Ok(BackendSandbox {
            endpoint: self.endpoint(&response)?,
            status: SandboxStatus::Pending,
        })
    }

    async fn discover(&self, sandbox_id: &str) -> SandboxResult<Option<BackendSandbox>> {
        let Some(response) = self.inspect(sandbox_id).await? else {
            return Ok(None);
        };
        if container_status(&response) != SandboxStatus::Running {
            return Ok(None);
        }
        Ok(Some(BackendSandbox {
            endpoint: self.endpoint(&response)?,
            status: self.probe(&response).await,
        }))
    }

    async fn status(&self, sandbox_id: &str) -> SandboxStatus {
        match self.inspect(sandbox_id).await {
            Ok(Some(response)) => self.probe(&response).await,
            Ok(None) => SandboxStatus::NotFound,
            Err(e) => {
                warn!(sandbox_id, error = %e, "Container status unavailable");
                SandboxStatus::Unknown
            }
        }
    }

    async fn destroy(&self, sandbox_id: &str) -> SandboxResult<()> {
        let name = self.container_name(sandbox_id);
        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!(container = %name, "Removed container");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(SandboxError::provisioning(format!(
                "failed to remove container {name}: {e}"
            ))),
        }
    }
}

/// Finds a reachable container runtime.
async fn detect_runtime() -> SandboxResult<(Docker, Runtime)> {
    if let Ok(docker) = Docker::connect_with_local_defaults() {
        if docker.ping().await.is_ok() {
            return Ok((docker, Runtime::Docker));
        }
    }

    let mut candidates: Vec<String> = PODMAN_SOCKETS.iter().map(|s| (*s).to_string()).collect();
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        candidates.insert(
            0,
            Path::new(&runtime_dir)
                .join("podman/podman.sock")
                .display()
                .to_string(),
        );
    }

    for socket in candidates.iter().filter(|s| Path::new(s).exists()) {
        if let Ok(docker) = Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION) {
            if docker.ping().await.is_ok() {
                return Ok((docker, Runtime::Podman));
            }
        }
    }

    Err(SandboxError::provisioning(
        "no container runtime found. Is Docker or Podman running?",
    ))
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

/// Maps container state onto the sandbox status enum.
fn container_status(response: &ContainerInspectResponse) -> SandboxStatus {
    let Some(state) = response.state.as_ref() else {
        return SandboxStatus::Unknown;
    };
    match state.status {
        Some(ContainerStateStatusEnum::CREATED | ContainerStateStatusEnum::RESTARTING) => {
            SandboxStatus::Pending
        }
        Some(ContainerStateStatusEnum::RUNNING) => SandboxStatus::Running,
        Some(ContainerStateStatusEnum::EXITED) => {
            if state.exit_code == Some(0) {
                SandboxStatus::Succeeded
            } else {
                SandboxStatus::Failed
            }
        }
        Some(ContainerStateStatusEnum::DEAD) => SandboxStatus::Failed,
        Some(ContainerStateStatusEnum::REMOVING) => SandboxStatus::NotFound,
        _ => SandboxStatus::Unknown,
    }
}

/// Host port bound to `container_port/tcp`.
fn published_port(response: &ContainerInspectResponse, container_port: u16) -> Option<u16> {
    response
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&format!("{container_port}/tcp"))?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
}

/// Renders `KEY=VALUE` pairs, reading `$NAME` values from the environment.
fn resolve_env(environment: &std::collections::BTreeMap<String, String>) -> Vec<String> {
    environment
        .iter()
        .map(|(key, value)| {
            let value = match value.strip_prefix('$') {
                Some(name) => std::env::var(name).unwrap_or_default(),
                None => value.clone(),
            };
            format!("{key}={value}")
        })
        .collect()
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> SandboxResult<String> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| SandboxError::provisioning("could not determine home directory"))?;
            Ok(home.join(rest).display().to_string())
        }
        None => Ok(path.to_string()),
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> SandboxResult<i64> {
    let limit = limit.to_lowercase();
    let invalid = || SandboxError::provisioning(format!("invalid memory limit: {limit}"));

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().map_err(|_| invalid())?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().map_err(|_| invalid())?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().map_err(|_| invalid())
    }
}
