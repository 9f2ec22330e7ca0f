//! Container lifecycle management: one sandbox container per workspace.
//!
//! Creation is idempotent and crash-safe: a crashed gateway can re-request
//! any workspace's container without producing duplicates or orphaned
//! volumes, and the durable named volume keeps workspace files across
//! container recreation.

use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::container::{ContainerConfig, ContainerInfo, ContainerResult, ContainerRuntimeApi};

/// Deterministic container name for a workspace.
pub fn container_name(workspace_id: &str) -> String {
    format!("workspace-{workspace_id}")
}

/// Deterministic volume name for a workspace.
pub fn volume_name(workspace_id: &str) -> String {
    format!("vol-{workspace_id}")
}

/// Lifecycle manager configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Sandbox image tag.
    pub image: String,
    /// Build context for the sandbox image; `None` disables local builds.
    pub build_context: Option<PathBuf>,
    /// Shared private network all workspace containers join.
    pub network: String,
    /// Mount point of the workspace volume inside the container.
    pub sandbox_root: String,
    /// Container port the agent listens on.
    pub agent_port: u16,
    /// Candidate application preview ports published alongside the agent port.
    pub preview_ports: Vec<u16>,
    /// Grace period for container stop.
    pub stop_timeout_secs: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            image: "cubby-sandbox:latest".to_string(),
            build_context: Some(PathBuf::from(".")),
            network: "workspace-net".to_string(),
            sandbox_root: "/workspace".to_string(),
            agent_port: 3001,
            preview_ports: vec![3000, 5173],
            stop_timeout_secs: 10,
        }
    }
}

/// Handle to a running workspace container.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub workspace_id: String,
    pub container_name: String,
}

/// One instance per process, constructed at startup and passed by reference
/// into the gateway. No teardown beyond process exit.
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: LifecycleConfig,
    /// Guards the build and caches its outcome for the process lifetime.
    image_built: Mutex<bool>,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: LifecycleConfig) -> Self {
        Self {
            runtime,
            config,
            image_built: Mutex::new(false),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Idempotently guarantee the sandbox image exists locally.
    ///
    /// A failed build is reported but non-fatal: callers proceed assuming an
    /// already-present image, and the container create will surface the real
    /// error if there isn't one.
    pub async fn ensure_image(&self) {
        let mut built = self.image_built.lock().await;
        if *built {
            return;
        }

        match self.runtime.image_exists(&self.config.image).await {
            Ok(true) => {
                *built = true;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("could not check for image {}: {}", self.config.image, e);
                return;
            }
        }

        let Some(context) = &self.config.build_context else {
            warn!(
                "image {} missing and no build context configured",
                self.config.image
            );
            return;
        };

        info!(
            "building sandbox image {} from {}",
            self.config.image,
            context.display()
        );
        match self.runtime.build_image(&self.config.image, context).await {
            Ok(()) => {
                *built = true;
                info!("sandbox image {} built", self.config.image);
            }
            Err(e) => warn!("failed to build sandbox image {}: {}", self.config.image, e),
        }
    }

    /// Create (or reuse) the container for a workspace. Idempotent.
    ///
    /// An existing container is started if stopped and returned as-is if
    /// running. Otherwise the workspace volume is ensured and a fresh
    /// container is launched on the shared network with all ports published
    /// to OS-assigned host ports.
    pub async fn create_container(&self, workspace_id: &str) -> ContainerResult<ContainerHandle> {
        self.ensure_image().await;

        let name = container_name(workspace_id);
        let handle = ContainerHandle {
            workspace_id: workspace_id.to_string(),
            container_name: name.clone(),
        };

        match self.runtime.state_status(&name).await? {
            Some(status) if status == "running" => {
                info!("container {name} already running");
                return Ok(handle);
            }
            Some(status) => {
                info!("container {name} exists ({status}), starting it");
                self.runtime.start_container(&name).await?;
                return Ok(handle);
            }
            None => {}
        }

        let volume = volume_name(workspace_id);
        if let Err(e) = self.runtime.create_volume(&volume).await {
            if !e.is_conflict() {
                return Err(e);
            }
        }

        self.runtime.ensure_network(&self.config.network).await?;

        let mut config = ContainerConfig::new(&self.config.image)
            .name(&name)
            .network(&self.config.network)
            .volume(&volume, &self.config.sandbox_root)
            .publish(self.config.agent_port)
            .env("WORKSPACE_ID", workspace_id);
        for port in &self.config.preview_ports {
            config = config.publish(*port);
        }

        match self.runtime.create_container(&config).await {
            Ok(id) => {
                info!("created container {name} ({id}) for workspace {workspace_id}");
                Ok(handle)
            }
            // A concurrent create won the race; the name now resolves to a
            // live container, which is exactly what we wanted.
            Err(e) if e.is_conflict() => {
                info!("container {name} created concurrently, reusing it");
                if let Some(status) = self.runtime.state_status(&name).await? {
                    if status != "running" {
                        self.runtime.start_container(&name).await?;
                    }
                }
                Ok(handle)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort teardown: stop, remove container, remove volume. Each
    /// step's failure is logged and never blocks the next step.
    pub async fn stop_container(&self, workspace_id: &str) {
        let name = container_name(workspace_id);
        let volume = volume_name(workspace_id);

        if let Err(e) = self
            .runtime
            .stop_container(&name, Some(self.config.stop_timeout_secs))
            .await
        {
            warn!("failed to stop container {name}: {e}");
        }
        if let Err(e) = self.runtime.remove_container(&name, true).await {
            warn!("failed to remove container {name}: {e}");
        }
        if let Err(e) = self.runtime.remove_volume(&volume).await {
            warn!("failed to remove volume {volume}: {e}");
        }
        info!("tore down workspace {workspace_id}");
    }

    /// Published ports and network address for a workspace's container, or
    /// `None` when it does not exist.
    pub async fn container_info(
        &self,
        workspace_id: &str,
    ) -> ContainerResult<Option<ContainerInfo>> {
        self.runtime
            .inspect_info(&container_name(workspace_id), Some(&self.config.network))
            .await
    }

    /// Reachable agent endpoint for a container.
    ///
    /// Prefers the published host-port mapping, which works across host/VM
    /// boundaries; falls back to the container's private network address,
    /// which only works when the gateway shares the network.
    pub fn agent_endpoint(&self, info: &ContainerInfo) -> Option<String> {
        if let Some(host_port) = info.host_port(self.config.agent_port) {
            return Some(format!("127.0.0.1:{host_port}"));
        }
        info.network_address
            .as_ref()
            .map(|addr| format!("{addr}:{}", self.config.agent_port))
    }
}
