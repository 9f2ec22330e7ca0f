//! Container runtime management module.
//!
//! Provides an async interface to manage containers, volumes and networks via
//! the Docker or Podman CLI. The runtime binary is auto-detected or can be
//! configured explicitly; all operations are also available behind the
//! [`ContainerRuntimeApi`] trait so tests can substitute a scripted fake.

mod container;
mod error;

pub use container::{
    validate_image_name, validate_resource_name, ContainerConfig, ContainerInfo, PublishedPort,
};
pub use error::{ContainerError, ContainerResult};

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use container::InspectEntry;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeType {
    /// Docker runtime (default for macOS/Windows dev)
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Container runtime abstraction. The production implementation shells out
/// to the CLI; tests inject fakes.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a new container, returning its id.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Start a stopped container.
    async fn start_container(&self, id_or_name: &str) -> ContainerResult<()>;

    /// Stop a running container.
    async fn stop_container(&self, id_or_name: &str, timeout_seconds: Option<u32>)
        -> ContainerResult<()>;

    /// Remove a container.
    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()>;

    /// Lifecycle state status ("running", "exited", ...); `None` when the
    /// container does not exist.
    async fn state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;

    /// Published ports and network address; `None` when the container does
    /// not exist.
    async fn inspect_info(
        &self,
        id_or_name: &str,
        network: Option<&str>,
    ) -> ContainerResult<Option<ContainerInfo>>;

    /// Whether an image exists locally.
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;

    /// Build an image from a local build context.
    async fn build_image(&self, tag: &str, context_dir: &Path) -> ContainerResult<()>;

    /// Create a named volume. Conflicts with an existing volume are errors;
    /// callers decide whether to ignore them.
    async fn create_volume(&self, name: &str) -> ContainerResult<()>;

    /// Remove a named volume.
    async fn remove_volume(&self, name: &str) -> ContainerResult<()>;

    /// Create the named bridge network if it does not already exist.
    async fn ensure_network(&self, name: &str) -> ContainerResult<()>;

    /// Runtime version string, used as a startup health check.
    async fn version(&self) -> ContainerResult<String>;
}

/// CLI-backed container runtime client.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection: Docker first,
    /// Podman as fallback.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        } else if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        } else {
            // Fall back to docker, will fail at runtime.
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run one CLI subcommand, returning trimmed stdout on success.
    async fn exec(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let mut args: Vec<String> = vec!["run".into(), "-d".into()];

        if let Some(ref name) = config.name {
            args.push("--name".into());
            args.push(name.clone());
        }

        if let Some(ref network) = config.network {
            args.push("--network".into());
            args.push(network.clone());
        }

        // Host port 0: the OS assigns a free port per published port.
        for port in &config.ports {
            args.push("-p".into());
            args.push(format!("0:{}", port.container_port));
        }

        for (volume, container_path) in &config.volumes {
            args.push("-v".into());
            args.push(format!("{volume}:{container_path}"));
        }

        for (key, value) in &config.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }

        args.push(config.image.clone());

        self.exec("run", &args).await
    }

    async fn start_container(&self, id_or_name: &str) -> ContainerResult<()> {
        validate_resource_name(id_or_name, "container name")?;
        self.exec("start", &["start".into(), id_or_name.into()])
            .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        id_or_name: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_resource_name(id_or_name, "container name")?;
        let mut args: Vec<String> = vec!["stop".into()];
        if let Some(t) = timeout_seconds {
            args.push("-t".into());
            args.push(t.to_string());
        }
        args.push(id_or_name.into());
        self.exec("stop", &args).await?;
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()> {
        validate_resource_name(id_or_name, "container name")?;
        let mut args: Vec<String> = vec!["rm".into()];
        if force {
            args.push("-f".into());
        }
        args.push(id_or_name.into());
        self.exec("rm", &args).await?;
        Ok(())
    }

    async fn state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        validate_resource_name(id_or_name, "container name")?;
        let args: Vec<String> = vec![
            "inspect".into(),
            "--format".into(),
            "{{.State.Status}}".into(),
            id_or_name.into(),
        ];
        match self.exec("inspect", &args).await {
            Ok(status) => {
                let status = status.trim_matches('"').to_string();
                Ok((!status.is_empty()).then_some(status))
            }
            // Container not found is not an error; callers treat it as missing.
            Err(ContainerError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn inspect_info(
        &self,
        id_or_name: &str,
        network: Option<&str>,
    ) -> ContainerResult<Option<ContainerInfo>> {
        validate_resource_name(id_or_name, "container name")?;
        let args: Vec<String> = vec![
            "inspect".into(),
            "--format".into(),
            "json".into(),
            id_or_name.into(),
        ];
        let stdout = match self.exec("inspect", &args).await {
            Ok(out) => out,
            Err(ContainerError::CommandFailed { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let entries: Vec<InspectEntry> = serde_json::from_str(&stdout)
            .map_err(|e| ContainerError::ParseError(e.to_string()))?;

        Ok(entries.into_iter().next().map(|e| e.into_info(network)))
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        let output = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "image inspect".to_string(),
                message: e.to_string(),
            })?;
        Ok(output.status.success())
    }

    async fn build_image(&self, tag: &str, context_dir: &Path) -> ContainerResult<()> {
        validate_image_name(tag)?;
        let args: Vec<String> = vec![
            "build".into(),
            "-t".into(),
            tag.into(),
            context_dir.to_string_lossy().into_owned(),
        ];
        self.exec("build", &args).await?;
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> ContainerResult<()> {
        validate_resource_name(name, "volume name")?;
        self.exec("volume create", &["volume".into(), "create".into(), name.into()])
            .await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ContainerResult<()> {
        validate_resource_name(name, "volume name")?;
        self.exec("volume rm", &["volume".into(), "rm".into(), name.into()])
            .await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> ContainerResult<()> {
        validate_resource_name(name, "network name")?;
        let result = self
            .exec("network create", &["network".into(), "create".into(), name.into()])
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn version(&self) -> ContainerResult<String> {
        self.exec(
            "version",
            &[
                "version".into(),
                "--format".into(),
                "{{.Server.Version}}".into(),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_type_binaries() {
        assert_eq!(RuntimeType::Docker.default_binary(), "docker");
        assert_eq!(RuntimeType::Podman.default_binary(), "podman");
    }

    #[test]
    fn conflict_detection() {
        let err = ContainerError::CommandFailed {
            command: "run".to_string(),
            message: "Error: the container name \"workspace-w1\" is already in use".to_string(),
        };
        assert!(err.is_conflict());

        let err = ContainerError::CommandFailed {
            command: "volume create".to_string(),
            message: "volume with name vol-w1 already exists".to_string(),
        };
        assert!(err.is_conflict());

        let err = ContainerError::CommandFailed {
            command: "run".to_string(),
            message: "no such image".to_string(),
        };
        assert!(!err.is_conflict());
    }
}
