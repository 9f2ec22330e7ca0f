//! Server configuration.
//!
//! Settings come from an optional TOML file overlaid with `CUBBY_*`
//! environment variables (`CUBBY_PORT`, `CUBBY_AUTH__JWT_SECRET`, ...).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::auth::AuthConfig;
use crate::lifecycle::LifecycleConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Address to bind the gateway on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on a `workspace:join` attempt, seconds. Every join
    /// completes (ready or error) within this window.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub container: ContainerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSettings {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_build_context")]
    pub build_context: Option<PathBuf>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: String,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    #[serde(default = "default_preview_ports")]
    pub preview_ports: Vec<u16>,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u32,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_join_timeout() -> u64 {
    30
}

fn default_image() -> String {
    "cubby-sandbox:latest".to_string()
}

fn default_build_context() -> Option<PathBuf> {
    Some(PathBuf::from("."))
}

fn default_network() -> String {
    "workspace-net".to_string()
}

fn default_sandbox_root() -> String {
    "/workspace".to_string()
}

fn default_agent_port() -> u16 {
    3001
}

fn default_preview_ports() -> Vec<u16> {
    vec![3000, 5173]
}

fn default_stop_timeout() -> u32 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            join_timeout_secs: default_join_timeout(),
            auth: AuthConfig::default(),
            container: ContainerSettings::default(),
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            build_context: default_build_context(),
            network: default_network(),
            sandbox_root: default_sandbox_root(),
            agent_port: default_agent_port(),
            preview_ports: default_preview_ports(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(Environment::with_prefix("CUBBY").separator("__"))
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .context("parsing configuration")
    }
}

impl From<&ContainerSettings> for LifecycleConfig {
    fn from(settings: &ContainerSettings) -> Self {
        Self {
            image: settings.image.clone(),
            build_context: settings.build_context.clone(),
            network: settings.network.clone(),
            sandbox_root: settings.sandbox_root.clone(),
            agent_port: settings.agent_port,
            preview_ports: settings.preview_ports.clone(),
            stop_timeout_secs: settings.stop_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let settings = Settings::default();
        assert_eq!(settings.port, 4000);
        assert_eq!(settings.container.agent_port, 3001);
        assert_eq!(settings.container.preview_ports, vec![3000, 5173]);
        assert!(settings.auth.required);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cubby.toml");
        std::fs::write(
            &path,
            r#"
port = 5000

[auth]
jwt_secret = "secret"
required = false

[container]
image = "custom-sandbox:dev"
preview_ports = [8080]
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.port, 5000);
        assert!(!settings.auth.required);
        assert_eq!(settings.container.image, "custom-sandbox:dev");
        assert_eq!(settings.container.preview_ports, vec![8080]);
        // Untouched fields keep their defaults.
        assert_eq!(settings.container.network, "workspace-net");
    }
}
