//! Container types, configuration and input validation.

use std::collections::HashMap;

use serde::Deserialize;

use super::error::{ContainerError, ContainerResult};

/// Port published from the container with an OS-assigned host port.
///
/// Host port 0 asks the runtime to pick a free port, so concurrently running
/// workspaces never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedPort {
    pub container_port: u16,
}

impl PublishedPort {
    pub fn new(container_port: u16) -> Self {
        Self { container_port }
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Container ports published with host-assigned port numbers.
    pub ports: Vec<PublishedPort>,
    /// Named-volume mounts (volume name -> container path).
    pub volumes: Vec<(String, String)>,
    /// Network to attach to.
    pub network: Option<String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all fields before shelling out.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        if let Some(ref name) = self.name {
            validate_resource_name(name, "container name")?;
        }
        if let Some(ref network) = self.network {
            validate_resource_name(network, "network name")?;
        }
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        for (volume, container_path) in &self.volumes {
            validate_resource_name(volume, "volume name")?;
            validate_container_path(container_path)?;
        }
        Ok(())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn publish(mut self, container_port: u16) -> Self {
        self.ports.push(PublishedPort::new(container_port));
        self
    }

    pub fn volume(mut self, volume: impl Into<String>, container_path: impl Into<String>) -> Self {
        self.volumes.push((volume.into(), container_path.into()));
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }
}

/// Published ports and network addressing for an existing container, read
/// from `inspect`.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    /// Lifecycle state status string ("running", "exited", ...).
    pub state: String,
    /// container port -> host port, for published ports with a binding.
    pub ports: HashMap<u16, u16>,
    /// Address on the shared private network, when attached to one.
    pub network_address: Option<String>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Host port a given container port is published on, if any.
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }
}

// ============================================================================
// Inspect output parsing
// ============================================================================

/// Subset of `inspect --format json` output the lifecycle manager needs.
#[derive(Debug, Deserialize)]
pub(super) struct InspectEntry {
    #[serde(rename = "State")]
    pub state: InspectState,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
pub(super) struct InspectState {
    #[serde(rename = "Status", default)]
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct InspectNetworkSettings {
    #[serde(rename = "Ports", default)]
    pub ports: HashMap<String, Option<Vec<InspectPortBinding>>>,
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, InspectNetwork>,
}

#[derive(Debug, Deserialize)]
pub(super) struct InspectPortBinding {
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

impl InspectEntry {
    /// Flatten the inspect payload into a [`ContainerInfo`], preferring the
    /// address on `network` when the container is attached to it.
    pub(super) fn into_info(self, network: Option<&str>) -> ContainerInfo {
        let mut ports = HashMap::new();
        for (spec, bindings) in self.network_settings.ports {
            // Keys look like "3001/tcp".
            let container_port = spec
                .split('/')
                .next()
                .and_then(|p| p.parse::<u16>().ok());
            let host_port = bindings
                .unwrap_or_default()
                .into_iter()
                .find_map(|b| b.host_port.parse::<u16>().ok());
            if let (Some(c), Some(h)) = (container_port, host_port) {
                ports.insert(c, h);
            }
        }

        let network_address = network
            .and_then(|name| self.network_settings.networks.get(name))
            .or_else(|| self.network_settings.networks.values().next())
            .map(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        ContainerInfo {
            state: self.state.status,
            ports,
            network_address,
        }
    }
}

// ============================================================================
// Input validation
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Valid characters: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }
    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };
    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }
    Ok(())
}

/// Validate a container, volume or network name: alphanumeric with hyphens
/// and underscores, starting with an alphanumeric character or underscore.
pub fn validate_resource_name(name: &str, what: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{what} cannot be empty"
        )));
    }
    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(format!(
            "{what} exceeds maximum length of 128 characters"
        )));
    }
    let first = name.chars().next().unwrap_or('-');
    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "{what} must start with an alphanumeric character or underscore"
        )));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "{what} '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate an environment variable key (POSIX conventions).
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    }
    let first = key.chars().next().unwrap_or('-');
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{key}' must start with a letter or underscore"
        )));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{key}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate a container-internal mount path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container path cannot be empty".to_string(),
        ));
    }
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }
    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain null bytes".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_image_name_accepts_common_forms() {
        assert!(validate_image_name("ubuntu").is_ok());
        assert!(validate_image_name("cubby-sandbox:latest").is_ok());
        assert!(validate_image_name("registry.io/team/image:v1.0").is_ok());
    }

    #[test]
    fn validate_image_name_rejects_injection() {
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("image$(whoami)").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn validate_resource_name_rules() {
        assert!(validate_resource_name("workspace-w1", "container name").is_ok());
        assert!(validate_resource_name("vol-w1", "volume name").is_ok());
        assert!(validate_resource_name("-leading-dash", "container name").is_err());
        assert!(validate_resource_name("has spaces", "container name").is_err());
        assert!(validate_resource_name("", "container name").is_err());
    }

    #[test]
    fn container_config_validate() {
        let config = ContainerConfig::new("cubby-sandbox:latest")
            .name("workspace-w1")
            .env("WORKSPACE_ID", "w1")
            .publish(3001)
            .volume("vol-w1", "/workspace")
            .network("workspace-net");
        assert!(config.validate().is_ok());

        let bad = ContainerConfig::new("cubby-sandbox").name("bad;name");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn inspect_entry_flattens_ports_and_address() {
        let raw = r#"[{
            "State": {"Status": "running"},
            "NetworkSettings": {
                "Ports": {
                    "3001/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32768"}],
                    "3000/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32769"}],
                    "5173/tcp": null
                },
                "Networks": {
                    "workspace-net": {"IPAddress": "172.20.0.5"}
                }
            }
        }]"#;
        let entries: Vec<InspectEntry> = serde_json::from_str(raw).unwrap();
        let info = entries
            .into_iter()
            .next()
            .unwrap()
            .into_info(Some("workspace-net"));

        assert!(info.is_running());
        assert_eq!(info.host_port(3001), Some(32768));
        assert_eq!(info.host_port(3000), Some(32769));
        assert_eq!(info.host_port(5173), None);
        assert_eq!(info.network_address.as_deref(), Some("172.20.0.5"));
    }
}
