//! Volume driver extension point.

use crate::error::{Result, VolumeError};
use crate::local::LocalDriver;
use crate::proxy::PluginDriver;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;
use vessel_error::CommonError;
use vessel_plugins::{PluginError, PluginStore};

/// Name reserved for the built-in driver.
pub const LOCAL_DRIVER_NAME: &str = "local";

/// Manifest capability advertised by volume plugins.
pub const VOLUME_DRIVER_CAPABILITY: &str = "VolumeDriver";

/// Capability set every volume driver implements.
///
/// `create` is idempotent by name: creating the same name twice must leave
/// the driver with one volume.
#[async_trait]
pub trait VolumeDriver: Send + Sync + std::fmt::Debug {
    /// Stable driver name, matching its registration.
    fn name(&self) -> &str;

    /// Creates (or finds) the named volume on the driver.
    async fn create(&self, name: &str) -> Result<()>;

    /// Removes the named volume. A driver may answer `NotFound`; the
    /// repository treats that as success.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Host-visible path at which the volume appears once mounted.
    async fn path(&self, name: &str) -> Result<PathBuf>;

    /// Prepares the volume for use by a container and returns its path.
    async fn mount(&self, name: &str) -> Result<PathBuf>;

    /// Releases one mount acquisition.
    async fn unmount(&self, name: &str) -> Result<()>;
}

/// Registry mapping driver names to implementations.
///
/// A lookup that misses consults the plugin store for a plugin advertising
/// the `VolumeDriver` capability, adapts it, and memoizes the adapter. The
/// mutex guards map mutation only; driver RPCs run with it released.
pub struct DriverRegistry {
    extensions: Mutex<HashMap<String, Arc<dyn VolumeDriver>>>,
    plugins: Arc<PluginStore>,
}

impl DriverRegistry {
    /// Creates the registry with the reserved `local` driver registered and
    /// the `VolumeDriver` capability handler installed on the plugin store,
    /// so plugins activated by any path self-register as drivers.
    pub fn new(plugins: Arc<PluginStore>, local_root: impl Into<PathBuf>) -> Arc<Self> {
        let registry = Arc::new(Self {
            extensions: Mutex::new(HashMap::new()),
            plugins,
        });
        registry.register(Arc::new(LocalDriver::new(local_root)), LOCAL_DRIVER_NAME);

        let weak: Weak<Self> = Arc::downgrade(&registry);
        registry
            .plugins
            .handle(VOLUME_DRIVER_CAPABILITY, move |name, client| {
                if let Some(registry) = weak.upgrade() {
                    let driver = Arc::new(PluginDriver::new(name, client));
                    if registry.register(driver, name) {
                        debug!(driver = name, "volume plugin registered");
                    }
                }
            });

        registry
    }

    /// Registers a driver under `name`; rejects empty names and duplicates.
    pub fn register(&self, driver: Arc<dyn VolumeDriver>, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let Ok(mut extensions) = self.extensions.lock() else {
            return false;
        };
        if extensions.contains_key(name) {
            return false;
        }
        extensions.insert(name.to_string(), driver);
        true
    }

    /// Removes a driver registration.
    pub fn unregister(&self, name: &str) -> bool {
        self.extensions
            .lock()
            .map(|mut extensions| extensions.remove(name).is_some())
            .unwrap_or(false)
    }

    /// Looks up a driver, falling back to plugin discovery on a miss. The
    /// empty name selects the `local` driver.
    ///
    /// # Errors
    ///
    /// `NotFound` when neither a registration nor a plugin provides the
    /// driver; plugin activation failures are surfaced.
    pub async fn lookup(&self, name: &str) -> Result<Arc<dyn VolumeDriver>> {
        let name = if name.is_empty() { LOCAL_DRIVER_NAME } else { name };
        if let Some(driver) = self.cached(name) {
            return Ok(driver);
        }

        let plugin = self
            .plugins
            .get_with_capability(name, VOLUME_DRIVER_CAPABILITY)
            .await
            .map_err(|e| match e {
                PluginError::Common(CommonError::NotFound(_)) => {
                    VolumeError::not_found(format!("volume driver {name}"))
                }
                other => VolumeError::Plugin(other),
            })?;

        // The capability handler usually registered the adapter during
        // activation; build one here only if it has not.
        if let Some(driver) = self.cached(name) {
            return Ok(driver);
        }
        let driver: Arc<dyn VolumeDriver> =
            Arc::new(PluginDriver::new(name, plugin.client().clone()));
        self.register(driver.clone(), name);
        Ok(driver)
    }

    fn cached(&self, name: &str) -> Option<Arc<dyn VolumeDriver>> {
        self.extensions.lock().ok()?.get(name).cloned()
    }
}
