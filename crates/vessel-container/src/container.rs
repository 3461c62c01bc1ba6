//! Container records and their persistence.

use crate::config::ContainerConfig;
use crate::error::Result;
use crate::mounts::MountPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use vessel_error::CommonError;

const CONFIG_FILE: &str = "config.json";

/// Container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new random container ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string().replace('-', "")[..12].to_string())
    }

    /// Creates a container ID from a string.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the ID as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Container lifecycle state, as the volume core needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Exited.
    Exited,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// A container record: configuration, state, and resolved mount points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Container ID.
    pub id: ContainerId,
    /// Container name.
    pub name: String,
    /// Configuration the container was created with.
    pub config: ContainerConfig,
    /// Current state.
    pub state: ContainerState,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Resolved mounts keyed by destination.
    #[serde(rename = "MountPoints", default)]
    pub mount_points: HashMap<PathBuf, MountPoint>,
    /// Host-side metadata directory.
    pub root: PathBuf,
    /// Host-facing root filesystem path, when materialized.
    #[serde(default)]
    pub basefs: Option<PathBuf>,
}

impl Container {
    /// Creates a record under `containers_root` with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, config: ContainerConfig, containers_root: &Path) -> Self {
        let id = ContainerId::new();
        let root = containers_root.join(id.as_str());
        Self {
            id,
            name: name.into(),
            config,
            state: ContainerState::Created,
            created: Utc::now(),
            mount_points: HashMap::new(),
            root,
            basefs: None,
        }
    }

    /// Returns whether the container is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Path of the container-owned `resolv.conf`.
    #[must_use]
    pub fn resolv_conf_path(&self) -> PathBuf {
        self.root.join("resolv.conf")
    }

    /// Path of the container-owned `hostname` file.
    #[must_use]
    pub fn hostname_path(&self) -> PathBuf {
        self.root.join("hostname")
    }

    /// Path of the container-owned `hosts` file.
    #[must_use]
    pub fn hosts_path(&self) -> PathBuf {
        self.root.join("hosts")
    }

    /// Persists the record into its metadata directory.
    ///
    /// # Errors
    ///
    /// Filesystem and encoding failures.
    pub fn to_disk(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(CommonError::from)?;
        let data = serde_json::to_vec(self)
            .map_err(|e| CommonError::internal(format!("encoding container record: {e}")))?;
        fs::write(self.root.join(CONFIG_FILE), data).map_err(CommonError::from)?;
        Ok(())
    }

    /// Loads a record from its metadata directory.
    ///
    /// # Errors
    ///
    /// Filesystem and decoding failures.
    pub fn from_disk(root: &Path) -> Result<Self> {
        let data = fs::read(root.join(CONFIG_FILE)).map_err(CommonError::from)?;
        let mut container: Self = serde_json::from_slice(&data)
            .map_err(|e| CommonError::internal(format!("decoding container record: {e}")))?;
        container.root = root.to_path_buf();
        Ok(container)
    }

    /// Writes the network files the runtime bind-mounts over `/etc` entries.
    ///
    /// The hosts and resolv.conf stubs are only seeded when absent so user
    /// edits survive restarts.
    ///
    /// # Errors
    ///
    /// Filesystem failures.
    pub fn ensure_network_files(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(CommonError::from)?;

        let hostname = self
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| self.id.to_string());
        fs::write(self.hostname_path(), format!("{hostname}\n")).map_err(CommonError::from)?;

        if !self.hosts_path().exists() {
            let hosts = format!("127.0.0.1\tlocalhost {hostname}\n::1\tlocalhost\n");
            fs::write(self.hosts_path(), hosts).map_err(CommonError::from)?;
        }

        if !self.resolv_conf_path().exists() {
            let content = fs::read("/etc/resolv.conf").unwrap_or_default();
            fs::write(self.resolv_conf_path(), content).map_err(CommonError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let mut container = Container::new(
            "web",
            ContainerConfig {
                image: "alpine".to_string(),
                ..ContainerConfig::default()
            },
            tmp.path(),
        );
        container.mount_points.insert(
            PathBuf::from("/data"),
            MountPoint {
                name: "vol1".to_string(),
                destination: PathBuf::from("/data"),
                driver: "local".to_string(),
                rw: true,
                source: None,
                volume: None,
            },
        );
        container.to_disk().unwrap();

        let loaded = Container::from_disk(&container.root).unwrap();
        assert_eq!(loaded.id, container.id);
        assert_eq!(loaded.name, "web");
        assert_eq!(loaded.state, ContainerState::Created);
        let mp = &loaded.mount_points[&PathBuf::from("/data")];
        assert_eq!(mp.name, "vol1");
        assert!(mp.volume.is_none());
    }

    #[test]
    fn mount_points_serialize_under_wire_key() {
        let tmp = TempDir::new().unwrap();
        let mut container = Container::new("web", ContainerConfig::default(), tmp.path());
        container.mount_points.insert(
            PathBuf::from("/data"),
            MountPoint {
                name: String::new(),
                destination: PathBuf::from("/data"),
                driver: String::new(),
                rw: false,
                source: Some(PathBuf::from("/host/data")),
                volume: None,
            },
        );

        let json = serde_json::to_value(&container).unwrap();
        assert_eq!(json["MountPoints"]["/data"]["Destination"], "/data");
        assert_eq!(json["MountPoints"]["/data"]["Source"], "/host/data");
        assert_eq!(json["MountPoints"]["/data"]["RW"], false);
    }

    #[test]
    fn network_files_are_created_once() {
        let tmp = TempDir::new().unwrap();
        let container = Container::new("web", ContainerConfig::default(), tmp.path());
        container.ensure_network_files().unwrap();

        assert!(container.hostname_path().exists());
        std::fs::write(container.hosts_path(), b"edited\n").unwrap();
        container.ensure_network_files().unwrap();
        assert_eq!(std::fs::read(container.hosts_path()).unwrap(), b"edited\n");
    }
}
