//! Central store of live volumes.
//!
//! The repository owns every volume object in the daemon, keyed by its
//! canonical mount path, and persists one metadata directory per volume so
//! the set survives restarts.

use crate::driver::{DriverRegistry, VolumeDriver, LOCAL_DRIVER_NAME};
use crate::error::{Result, VolumeError};
use crate::paths;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};
use vessel_error::CommonError;

const METADATA_FILE: &str = "config.json";

/// How a volume is requested from the repository.
#[derive(Debug, Clone, Copy)]
pub enum VolumeSource<'a> {
    /// Pass-through for a user-supplied absolute host path.
    HostPath(&'a Path),
    /// Driver-managed volume with a caller-chosen name.
    Named(&'a str),
    /// Driver-managed volume with a generated id.
    Anonymous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VolumeMetadata {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Path")]
    path: PathBuf,
    #[serde(rename = "Driver")]
    driver: String,
    #[serde(rename = "IsBindMount")]
    is_bind_mount: bool,
    #[serde(rename = "Writable")]
    writable: bool,
}

/// A named, driver-backed unit of storage.
///
/// The refs set is the gate for deletion: a volume disappears only when no
/// container references it and removal is explicitly requested.
pub struct Volume {
    id: String,
    driver_name: String,
    path: PathBuf,
    is_bind_mount: bool,
    writable: bool,
    config_path: PathBuf,
    driver: Arc<dyn VolumeDriver>,
    containers: RwLock<HashSet<String>>,
}

impl Volume {
    /// Volume name (its id within the driver).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.id
    }

    /// Name of the owning driver.
    #[must_use]
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Canonical host-side mount path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True for pass-through host-path binds.
    #[must_use]
    pub const fn is_bind_mount(&self) -> bool {
        self.is_bind_mount
    }

    /// Whether containers may write through the volume.
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.writable
    }

    /// Records a container reference.
    pub fn add_container(&self, id: &str) {
        if let Ok(mut containers) = self.containers.write() {
            containers.insert(id.to_string());
        }
    }

    /// Drops a container reference.
    pub fn remove_container(&self, id: &str) {
        if let Ok(mut containers) = self.containers.write() {
            containers.remove(id);
        }
    }

    /// Ids of the containers currently referencing the volume.
    #[must_use]
    pub fn containers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .containers
            .read()
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Number of containers referencing the volume.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.containers.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Prepares the volume for a container and returns the host path.
    ///
    /// Bind mounts materialize by ensuring the host directory exists;
    /// driver-managed volumes go through the driver, which reference counts
    /// remote mounts.
    ///
    /// # Errors
    ///
    /// Driver and filesystem failures.
    pub async fn mount(&self) -> Result<PathBuf> {
        if self.is_bind_mount {
            if !self.path.exists() {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true).mode(0o755);
                builder.create(&self.path).map_err(CommonError::from)?;
            }
            return Ok(self.path.clone());
        }
        self.driver.mount(&self.id).await
    }

    /// Releases one mount acquisition.
    ///
    /// # Errors
    ///
    /// Driver failures.
    pub async fn unmount(&self) -> Result<()> {
        if self.is_bind_mount {
            return Ok(());
        }
        self.driver.unmount(&self.id).await
    }

    fn to_disk(&self) -> Result<()> {
        fs::create_dir_all(&self.config_path).map_err(CommonError::from)?;
        let metadata = VolumeMetadata {
            id: self.id.clone(),
            path: self.path.clone(),
            driver: self.driver_name.clone(),
            is_bind_mount: self.is_bind_mount,
            writable: self.writable,
        };
        let data = serde_json::to_vec(&metadata)
            .map_err(|e| CommonError::internal(format!("encoding volume metadata: {e}")))?;
        fs::write(self.config_path.join(METADATA_FILE), data).map_err(CommonError::from)?;
        Ok(())
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("driver", &self.driver_name)
            .field("path", &self.path)
            .field("is_bind_mount", &self.is_bind_mount)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

/// Central store of live volume objects.
///
/// The map mutex is held for map and index bookkeeping only; driver calls
/// run with it released. Per-key async guards keep concurrent creations of
/// one volume down to a single driver round trip, and make concurrent
/// deletes resolve to at most one winner.
pub struct Repository {
    config_path: PathBuf,
    drivers: Arc<DriverRegistry>,
    volumes: Mutex<HashMap<PathBuf, Arc<Volume>>>,
    /// `(driver, name)` → canonical path, so repeated named requests skip
    /// the driver round trip.
    names: Mutex<HashMap<(String, String), PathBuf>>,
    pending: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Repository {
    /// Creates the repository with its metadata root at `config_path`.
    ///
    /// # Errors
    ///
    /// Filesystem failures creating the metadata root.
    pub fn new(config_path: impl Into<PathBuf>, drivers: Arc<DriverRegistry>) -> Result<Self> {
        let config_path = config_path.into();
        fs::create_dir_all(&config_path).map_err(CommonError::from)?;
        Ok(Self {
            config_path,
            drivers,
            volumes: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Looks up a volume by path; `None` is not an error.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<Arc<Volume>> {
        let key = paths::canonical(path);
        self.volumes.lock().ok()?.get(&key).cloned()
    }

    /// Returns every live volume.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Volume>> {
        self.volumes
            .lock()
            .map(|volumes| volumes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the volume for `source`, creating it on first request.
    ///
    /// Host-path sources return the existing entry when the canonical path
    /// is already known (the existing writable flag wins); driver-managed
    /// sources create through the selected driver (empty name selects
    /// `local`). Concurrent calls for the same volume observe one creation.
    ///
    /// # Errors
    ///
    /// Driver resolution or creation failures, with path and driver context.
    pub async fn find_or_create(
        &self,
        source: VolumeSource<'_>,
        driver_name: &str,
        writable: bool,
    ) -> Result<Arc<Volume>> {
        match source {
            VolumeSource::HostPath(path) => self.find_or_create_bind(path, writable).await,
            VolumeSource::Named(name) => {
                self.find_or_create_named(name, driver_name, writable).await
            }
            VolumeSource::Anonymous => {
                let id = generate_id();
                self.find_or_create_named(&id, driver_name, writable).await
            }
        }
    }

    async fn find_or_create_bind(&self, path: &Path, writable: bool) -> Result<Arc<Volume>> {
        let key = paths::canonical(path);
        let _guard = self.operation_guard(&key.to_string_lossy()).await;

        if let Some(existing) = self.lookup(&key)? {
            return Ok(existing);
        }

        let id = generate_id();
        let driver = self.drivers.lookup(LOCAL_DRIVER_NAME).await?;
        let volume = Arc::new(Volume {
            id: id.clone(),
            driver_name: LOCAL_DRIVER_NAME.to_string(),
            path: key,
            is_bind_mount: true,
            writable,
            config_path: self.config_path.join(&id),
            driver,
            containers: RwLock::new(HashSet::new()),
        });
        volume.to_disk()?;
        self.insert_or_existing(volume)
    }

    async fn find_or_create_named(
        &self,
        name: &str,
        driver_name: &str,
        writable: bool,
    ) -> Result<Arc<Volume>> {
        let driver = self.drivers.lookup(driver_name).await?;
        let guard_key = format!("{}/{name}", driver.name());
        let _guard = self.operation_guard(&guard_key).await;

        if let Some(existing) = self.lookup_named(driver.name(), name)? {
            return Ok(existing);
        }

        driver.create(name).await?;
        let path = driver.path(name).await?;
        let key = paths::canonical(&path);

        if let Some(existing) = self.lookup(&key)? {
            self.index_name(driver.name(), name, &key)?;
            return Ok(existing);
        }

        let volume = Arc::new(Volume {
            id: name.to_string(),
            driver_name: driver.name().to_string(),
            path: key.clone(),
            is_bind_mount: false,
            writable,
            config_path: self.config_path.join(name),
            driver,
            containers: RwLock::new(HashSet::new()),
        });
        volume.to_disk()?;
        self.index_name(volume.driver_name(), name, &key)?;
        self.insert_or_existing(volume)
    }

    /// Deletes the volume at `path`.
    ///
    /// Fails with `InUse` while containers reference it. `NotFound` from
    /// the driver is absorbed; the map entry is removed last so a failed
    /// delete leaves the volume visible.
    ///
    /// # Errors
    ///
    /// `NotFound` when no volume lives at the path, `InUse` when referenced,
    /// driver and filesystem failures otherwise.
    pub async fn delete(&self, path: &Path) -> Result<()> {
        let key = paths::canonical(path);
        let _guard = self.operation_guard(&key.to_string_lossy()).await;

        let volume = self
            .lookup(&key)?
            .ok_or_else(|| VolumeError::not_found(format!("volume {}", key.display())))?;

        let containers = volume.containers();
        if !containers.is_empty() {
            return Err(VolumeError::InUse {
                path: key.display().to_string(),
                containers,
            });
        }

        if volume.config_path.exists() {
            fs::remove_dir_all(&volume.config_path).map_err(CommonError::from)?;
        }

        if !volume.is_bind_mount {
            match volume.driver.remove(&volume.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(volume = %volume.id, "driver had already removed the volume");
                }
                Err(e) => return Err(e),
            }
            let mut names = self
                .names
                .lock()
                .map_err(|_| CommonError::internal("volume name index lock poisoned"))?;
            names.remove(&(volume.driver_name.clone(), volume.id.clone()));
        }

        let mut volumes = self
            .volumes
            .lock()
            .map_err(|_| CommonError::internal("volume repository lock poisoned"))?;
        volumes.remove(&key);
        Ok(())
    }

    /// Rebuilds the in-memory map from on-disk metadata.
    ///
    /// Entries that fail to parse, or whose driver cannot be resolved, are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Only reading the metadata root itself can fail.
    pub async fn restore(&self) -> Result<()> {
        let entries = fs::read_dir(&self.config_path).map_err(CommonError::from)?;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            match self.restore_volume(&entry.path()).await {
                Ok(volume) => debug!(volume = %volume.name(), "volume restored"),
                Err(e) => {
                    warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "skipping unrestorable volume metadata"
                    );
                }
            }
        }
        Ok(())
    }

    async fn restore_volume(&self, dir: &Path) -> Result<Arc<Volume>> {
        let data = fs::read(dir.join(METADATA_FILE)).map_err(CommonError::from)?;
        let metadata: VolumeMetadata = serde_json::from_slice(&data)
            .map_err(|e| CommonError::internal(format!("decoding volume metadata: {e}")))?;
        let driver = self.drivers.lookup(&metadata.driver).await?;

        let key = paths::canonical(&metadata.path);
        let volume = Arc::new(Volume {
            id: metadata.id,
            driver_name: metadata.driver,
            path: key.clone(),
            is_bind_mount: metadata.is_bind_mount,
            writable: metadata.writable,
            config_path: dir.to_path_buf(),
            driver,
            containers: RwLock::new(HashSet::new()),
        });
        if !volume.is_bind_mount {
            self.index_name(volume.driver_name(), volume.name(), &key)?;
        }
        self.insert_or_existing(volume)
    }

    fn lookup(&self, key: &Path) -> Result<Option<Arc<Volume>>> {
        let volumes = self
            .volumes
            .lock()
            .map_err(|_| CommonError::internal("volume repository lock poisoned"))?;
        Ok(volumes.get(key).cloned())
    }

    fn lookup_named(&self, driver: &str, name: &str) -> Result<Option<Arc<Volume>>> {
        let path = {
            let names = self
                .names
                .lock()
                .map_err(|_| CommonError::internal("volume name index lock poisoned"))?;
            names.get(&(driver.to_string(), name.to_string())).cloned()
        };
        match path {
            Some(path) => self.lookup(&path),
            None => Ok(None),
        }
    }

    fn index_name(&self, driver: &str, name: &str, key: &Path) -> Result<()> {
        let mut names = self
            .names
            .lock()
            .map_err(|_| CommonError::internal("volume name index lock poisoned"))?;
        names.insert((driver.to_string(), name.to_string()), key.to_path_buf());
        Ok(())
    }

    fn insert_or_existing(&self, volume: Arc<Volume>) -> Result<Arc<Volume>> {
        let mut volumes = self
            .volumes
            .lock()
            .map_err(|_| CommonError::internal("volume repository lock poisoned"))?;
        Ok(volumes
            .entry(volume.path.clone())
            .or_insert(volume)
            .clone())
    }

    async fn operation_guard(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Random 64-hex volume id.
fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
