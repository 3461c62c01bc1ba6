//! Daemon-side container volume lifecycle.
//!
//! Wires the mount-point resolver into container create, start, and remove,
//! and reconciles persisted containers against the volume repository after
//! a daemon restart.

use crate::config::{ContainerConfig, HostConfig};
use crate::container::{Container, ContainerId, ContainerState};
use crate::error::{ContainerError, Result};
use crate::mounts::{self, MountPoint, RuntimeMount};
use crate::rootfs;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use vessel_error::CommonError;
use vessel_volume::{paths, Repository, Volume, VolumeSource};

/// Container store plus the volume wiring for its lifecycle.
///
/// The container map lock is held for map reads and writes only; volume
/// resolution and driver I/O run with it released, against cloned records.
pub struct Daemon {
    root: PathBuf,
    volumes: Arc<Repository>,
    containers: RwLock<HashMap<ContainerId, Container>>,
}

impl Daemon {
    /// Creates a daemon rooted at `root`; container records live under
    /// `<root>/containers`.
    ///
    /// # Errors
    ///
    /// Filesystem failures creating the container root.
    pub fn new(root: impl Into<PathBuf>, volumes: Arc<Repository>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("containers")).map_err(CommonError::from)?;
        Ok(Self {
            root,
            volumes,
            containers: RwLock::new(HashMap::new()),
        })
    }

    /// The volume repository this daemon resolves against.
    #[must_use]
    pub const fn repository(&self) -> &Arc<Repository> {
        &self.volumes
    }

    fn containers_root(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Looks up a container by id or name.
    ///
    /// # Errors
    ///
    /// `NotFound` when no container matches.
    pub fn get(&self, id_or_name: &str) -> Result<Container> {
        let containers = self
            .containers
            .read()
            .map_err(|_| CommonError::internal("container store lock poisoned"))?;
        containers
            .values()
            .find(|c| c.id.as_str() == id_or_name || c.name == id_or_name)
            .cloned()
            .ok_or_else(|| ContainerError::not_found(format!("container {id_or_name}")))
    }

    /// Lists all containers.
    #[must_use]
    pub fn list(&self) -> Vec<Container> {
        self.containers
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Creates a container with its mount points resolved and its volumes
    /// referenced.
    ///
    /// `rootfs` is the host-facing root the graph driver materialized, when
    /// one exists; it gates the file-exists check and the initial copy of
    /// rootfs content into fresh writable volumes.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` for a taken name, resolver errors (`InvalidSpec`,
    /// `DuplicateBind`, `FileExists`, missing peers), and volume failures.
    /// On error no container is registered.
    pub async fn create_container(
        &self,
        name: &str,
        config: ContainerConfig,
        host_config: &HostConfig,
        rootfs: Option<&Path>,
    ) -> Result<ContainerId> {
        {
            let containers = self
                .containers
                .read()
                .map_err(|_| CommonError::internal("container store lock poisoned"))?;
            if containers.values().any(|c| c.name == name) {
                return Err(CommonError::already_exists(format!("container {name}")).into());
            }
        }

        let mut container = Container::new(name, config, &self.containers_root());
        container.basefs = rootfs.map(Path::to_path_buf);

        container.mount_points = self.resolve_mount_points(&container, host_config).await?;
        for mount_point in container.mount_points.values() {
            if let Some(volume) = &mount_point.volume {
                volume.add_container(container.id.as_str());
            }
        }
        self.seed_volumes(&container)?;
        container.to_disk()?;

        let id = container.id.clone();
        let mut containers = self
            .containers
            .write()
            .map_err(|_| CommonError::internal("container store lock poisoned"))?;
        containers.insert(id.clone(), container);
        Ok(id)
    }

    /// Merges the container's persisted mounts, its peers' mounts, its bind
    /// list, and its config volumes into one set keyed by destination.
    ///
    /// Later passes overwrite earlier ones at the same destination, so the
    /// net precedence is binds over volumes-from over persisted mounts;
    /// config volumes only fill destinations nothing else claimed.
    async fn resolve_mount_points(
        &self,
        container: &Container,
        host_config: &HostConfig,
    ) -> Result<HashMap<PathBuf, MountPoint>> {
        let mut mount_points = container.mount_points.clone();

        for spec in &host_config.volumes_from {
            let (peer_id, writable) = mounts::parse_volumes_from(spec)?;
            let peer = self.get(&peer_id)?;
            for peer_mount in peer.mount_points.values() {
                let mut inherited = peer_mount.clone();
                inherited.rw = peer_mount.rw && writable;
                inherited.volume = self.reattach_volume(peer_mount).await?;
                mount_points.insert(inherited.destination.clone(), inherited);
            }
        }

        // Parse the whole bind list up front so a duplicate destination
        // fails before any volume is created.
        let mut binds = Vec::with_capacity(host_config.binds.len());
        let mut destinations = HashSet::new();
        for spec in &host_config.binds {
            let bind = mounts::parse_bind_spec(spec)?;
            if !destinations.insert(bind.destination.clone()) {
                return Err(ContainerError::DuplicateBind(
                    bind.destination.display().to_string(),
                ));
            }
            binds.push(bind);
        }

        for bind in binds {
            let mount_point = match (&bind.name, &bind.source) {
                (Some(name), _) => {
                    let volume = self
                        .volumes
                        .find_or_create(
                            VolumeSource::Named(name),
                            &container.config.volume_driver,
                            bind.rw,
                        )
                        .await?;
                    MountPoint {
                        name: volume.name().to_string(),
                        destination: bind.destination.clone(),
                        driver: volume.driver_name().to_string(),
                        rw: bind.rw,
                        source: None,
                        volume: Some(volume),
                    }
                }
                (None, Some(source)) => {
                    let volume = self
                        .volumes
                        .find_or_create(VolumeSource::HostPath(source), "", bind.rw)
                        .await?;
                    let (name, driver) = if volume.is_bind_mount() {
                        (String::new(), String::new())
                    } else {
                        (volume.name().to_string(), volume.driver_name().to_string())
                    };
                    MountPoint {
                        name,
                        destination: bind.destination.clone(),
                        driver,
                        rw: bind.rw,
                        source: Some(volume.path().to_path_buf()),
                        volume: Some(volume),
                    }
                }
                (None, None) => {
                    return Err(ContainerError::InvalidSpec(
                        bind.destination.display().to_string(),
                    ))
                }
            };
            mount_points.insert(mount_point.destination.clone(), mount_point);
        }

        for destination in container.config.volumes.keys() {
            let destination = paths::clean(Path::new(destination));
            if !destination.is_absolute() {
                return Err(ContainerError::InvalidSpec(
                    destination.display().to_string(),
                ));
            }
            if mount_points.contains_key(&destination) {
                continue;
            }
            let volume = self
                .volumes
                .find_or_create(
                    VolumeSource::Anonymous,
                    &container.config.volume_driver,
                    true,
                )
                .await?;
            mount_points.insert(
                destination.clone(),
                MountPoint {
                    name: volume.name().to_string(),
                    destination,
                    driver: volume.driver_name().to_string(),
                    rw: true,
                    source: None,
                    volume: Some(volume),
                },
            );
        }

        if let Some(basefs) = &container.basefs {
            for mount_point in mount_points.values() {
                let resolved = rootfs::resolve_in_scope(basefs, &mount_point.destination)?;
                if resolved.is_file() {
                    return Err(ContainerError::FileExists(resolved));
                }
            }
        }

        Ok(mount_points)
    }

    /// Re-establishes the live volume behind a mount point: driver-backed
    /// mounts go through the repository by name, literal binds reattach by
    /// path when the repository knows them.
    async fn reattach_volume(&self, mount_point: &MountPoint) -> Result<Option<Arc<Volume>>> {
        if let Some(volume) = &mount_point.volume {
            return Ok(Some(volume.clone()));
        }
        if !mount_point.driver.is_empty() && !mount_point.name.is_empty() {
            let volume = self
                .volumes
                .find_or_create(
                    VolumeSource::Named(&mount_point.name),
                    &mount_point.driver,
                    mount_point.rw,
                )
                .await?;
            return Ok(Some(volume));
        }
        if let Some(source) = &mount_point.source {
            return Ok(self.volumes.get(source));
        }
        Ok(None)
    }

    fn seed_volumes(&self, container: &Container) -> Result<()> {
        let Some(basefs) = &container.basefs else {
            return Ok(());
        };
        for mount_point in container.mount_points.values() {
            let Some(volume) = &mount_point.volume else {
                continue;
            };
            if volume.is_bind_mount() || !volume.writable() {
                continue;
            }
            let source = rootfs::resolve_in_scope(basefs, &mount_point.destination)?;
            if source.is_dir() {
                rootfs::copy_existing_contents(&source, volume.path())?;
            }
        }
        Ok(())
    }

    /// Mounts every volume and returns the runtime mount list: volume and
    /// bind mounts sorted parents-first, then the private network-file
    /// mounts for `/etc/resolv.conf`, `/etc/hostname`, and `/etc/hosts`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown container; driver and filesystem failures.
    pub async fn setup_mounts(&self, id_or_name: &str) -> Result<Vec<RuntimeMount>> {
        let container = self.get(id_or_name)?;

        let mut runtime_mounts = Vec::with_capacity(container.mount_points.len() + 3);
        for mount_point in container.mount_points.values() {
            let source = mount_point.setup().await?;
            let destination = match &container.basefs {
                Some(basefs) => {
                    let resolved = rootfs::resolve_in_scope(basefs, &mount_point.destination)?;
                    rootfs::scoped_destination(basefs, &resolved)
                }
                None => mount_point.destination.clone(),
            };
            runtime_mounts.push(RuntimeMount {
                source,
                destination,
                writable: mount_point.rw,
                private: false,
            });
        }
        mounts::sort_mounts(&mut runtime_mounts);

        container.ensure_network_files()?;
        for (source, destination) in [
            (container.resolv_conf_path(), "/etc/resolv.conf"),
            (container.hostname_path(), "/etc/hostname"),
            (container.hosts_path(), "/etc/hosts"),
        ] {
            runtime_mounts.push(RuntimeMount {
                source,
                destination: PathBuf::from(destination),
                writable: true,
                private: true,
            });
        }

        self.update(&container.id, |c| c.state = ContainerState::Running)?;
        Ok(runtime_mounts)
    }

    /// Releases every volume mount the container holds and marks it exited.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown container; driver failures.
    pub async fn release_mounts(&self, id_or_name: &str) -> Result<()> {
        let container = self.get(id_or_name)?;
        for mount_point in container.mount_points.values() {
            if let Some(volume) = &mount_point.volume {
                volume.unmount().await?;
            }
        }
        self.update(&container.id, |c| c.state = ContainerState::Exited)?;
        Ok(())
    }

    /// Removes a container, dereferencing every volume it uses.
    ///
    /// Volumes whose refcount reaches zero stay alive; only `remove_volumes`
    /// asks the repository to delete the container's managed volumes, and a
    /// volume still shared with another container is left in place.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown container, `InvalidState` while it runs.
    pub async fn remove_container(&self, id_or_name: &str, remove_volumes: bool) -> Result<()> {
        let container = self.get(id_or_name)?;
        if container.is_running() {
            return Err(CommonError::invalid_state(format!(
                "cannot remove running container {}",
                container.id
            ))
            .into());
        }

        {
            let mut containers = self
                .containers
                .write()
                .map_err(|_| CommonError::internal("container store lock poisoned"))?;
            containers.remove(&container.id);
        }

        for mount_point in container.mount_points.values() {
            if let Some(volume) = &mount_point.volume {
                volume.remove_container(container.id.as_str());
            }
        }

        if remove_volumes {
            for mount_point in container.mount_points.values() {
                let Some(volume) = &mount_point.volume else {
                    continue;
                };
                if volume.is_bind_mount() {
                    continue;
                }
                match self.volumes.delete(volume.path()).await {
                    Ok(()) => debug!(volume = %volume.name(), "volume removed"),
                    Err(e) if e.is_in_use() => {
                        debug!(volume = %volume.name(), "volume still shared, keeping it");
                    }
                    Err(e) => warn!(volume = %volume.name(), error = %e, "volume removal failed"),
                }
            }
        }

        if let Err(e) = fs::remove_dir_all(&container.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(CommonError::from(e).into());
            }
        }
        Ok(())
    }

    /// Restores the repository, then reloads every persisted container and
    /// reattaches its volumes; missing driver-backed volumes are re-created
    /// with their persisted driver name.
    ///
    /// Unreadable records are logged and skipped so one broken container
    /// does not prevent the daemon from starting.
    ///
    /// # Errors
    ///
    /// Repository restore failures and reading the containers root.
    pub async fn restore(&self) -> Result<()> {
        self.volumes.restore().await?;

        let entries = fs::read_dir(self.containers_root()).map_err(CommonError::from)?;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let mut container = match Container::from_disk(&entry.path()) {
                Ok(container) => container,
                Err(e) => {
                    warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "skipping unreadable container record"
                    );
                    continue;
                }
            };

            let mount_points = std::mem::take(&mut container.mount_points);
            for (destination, mut mount_point) in mount_points {
                match self.reattach_volume(&mount_point).await {
                    Ok(Some(volume)) => {
                        volume.add_container(container.id.as_str());
                        mount_point.volume = Some(volume);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            container = %container.id,
                            destination = %destination.display(),
                            error = %e,
                            "failed to reattach volume"
                        );
                    }
                }
                container.mount_points.insert(destination, mount_point);
            }

            // The runtime did not survive the daemon; running containers
            // come back exited.
            if container.is_running() {
                container.state = ContainerState::Exited;
                if let Err(e) = container.to_disk() {
                    warn!(container = %container.id, error = %e, "failed to persist state");
                }
            }

            debug!(container = %container.id, "container restored");
            let mut containers = self
                .containers
                .write()
                .map_err(|_| CommonError::internal("container store lock poisoned"))?;
            containers.insert(container.id.clone(), container);
        }
        Ok(())
    }

    fn update(&self, id: &ContainerId, f: impl FnOnce(&mut Container)) -> Result<()> {
        let mut containers = self
            .containers
            .write()
            .map_err(|_| CommonError::internal("container store lock poisoned"))?;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| ContainerError::not_found(id.to_string()))?;
        f(container);
        container.to_disk()?;
        Ok(())
    }
}
