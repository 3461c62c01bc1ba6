//! Container configuration inputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Image-and-user-supplied container configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image name.
    pub image: String,
    /// Command to run.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Environment variables, `KEY=value`.
    #[serde(default)]
    pub env: Vec<String>,
    /// Hostname inside the container.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Destinations that receive anonymous volumes, `{"/path": {}}`.
    #[serde(default)]
    pub volumes: BTreeMap<String, serde_json::Value>,
    /// Default driver for volumes this container creates; empty selects
    /// the built-in driver.
    #[serde(default)]
    pub volume_driver: String,
}

/// Start-time host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Bind specifications, `<source>:<dest>[:ro|rw]`.
    #[serde(default)]
    pub binds: Vec<String>,
    /// Containers whose mount points are inherited, `<id>[:ro|rw]`.
    #[serde(default)]
    pub volumes_from: Vec<String>,
}
