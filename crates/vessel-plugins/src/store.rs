//! Plugin activation and the active-plugin store.

use crate::client::PluginClient;
use crate::discovery::{LocalRegistry, PluginDescriptor};
use crate::error::{PluginError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use vessel_error::CommonError;

const ACTIVATE_METHOD: &str = "Plugin.Activate";

/// Capability manifest returned by `Plugin.Activate`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    /// Capabilities the plugin advertises, e.g. `"VolumeDriver"`.
    #[serde(rename = "Implements", default)]
    pub implements: Vec<String>,
}

type CapabilityHandler = Arc<dyn Fn(&str, PluginClient) + Send + Sync>;

/// A discovered plugin and its activation state.
///
/// The manifest cell is written at most once; until then the plugin is
/// dormant and a failed handshake leaves it dormant so the next caller
/// retries.
#[derive(Debug)]
pub struct Plugin {
    name: String,
    addr: String,
    client: PluginClient,
    manifest: OnceCell<Manifest>,
}

impl Plugin {
    fn new(descriptor: &PluginDescriptor) -> Result<Self> {
        Ok(Self {
            name: descriptor.name.clone(),
            addr: descriptor.addr.clone(),
            client: PluginClient::new(&descriptor.addr)?,
            manifest: OnceCell::new(),
        })
    }

    /// Plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint address the plugin was discovered at.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Client for the plugin's endpoint.
    #[must_use]
    pub const fn client(&self) -> &PluginClient {
        &self.client
    }

    /// Manifest, when the plugin has been activated.
    #[must_use]
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.get()
    }

    /// True when the activated manifest advertises `capability`.
    #[must_use]
    pub fn implements(&self, capability: &str) -> bool {
        self.manifest
            .get()
            .is_some_and(|m| m.implements.iter().any(|c| c == capability))
    }
}

/// Discovery, activation, and capability dispatch for plugins.
///
/// The active-plugin map and the handler map are guarded by their own
/// mutexes. Handlers are invoked while a plugin's activation is in flight,
/// with the handler mutex released, so they must not reenter the store.
pub struct PluginStore {
    registry: LocalRegistry,
    plugins: Mutex<HashMap<String, Arc<Plugin>>>,
    handlers: Mutex<HashMap<String, CapabilityHandler>>,
}

impl PluginStore {
    /// Creates a store backed by the given discovery registry.
    #[must_use]
    pub fn new(registry: LocalRegistry) -> Self {
        Self {
            registry,
            plugins: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a handler invoked for every newly activated plugin that
    /// advertises `capability`.
    pub fn handle<F>(&self, capability: impl Into<String>, handler: F)
    where
        F: Fn(&str, PluginClient) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(capability.into(), Arc::new(handler));
        }
    }

    /// Returns the active plugin, discovering and activating it if needed.
    ///
    /// Concurrent callers for one name share a single `Plugin.Activate`
    /// round trip; the loser awaits the winner's result.
    ///
    /// # Errors
    ///
    /// Discovery and activation failures are surfaced to the caller.
    pub async fn get(&self, name: &str) -> Result<Arc<Plugin>> {
        let plugin = self.cached_or_discover(name)?;
        self.activate(&plugin).await?;
        Ok(plugin)
    }

    /// Returns the plugin when it is active and advertises `capability`.
    ///
    /// # Errors
    ///
    /// `NotImplemented` when the manifest does not list the capability, plus
    /// any `get` error.
    pub async fn get_with_capability(&self, name: &str, capability: &str) -> Result<Arc<Plugin>> {
        let plugin = self.get(name).await?;
        if !plugin.implements(capability) {
            return Err(PluginError::NotImplemented {
                plugin: name.to_string(),
                capability: capability.to_string(),
            });
        }
        Ok(plugin)
    }

    /// Discovers and activates every plugin the registry advertises.
    ///
    /// Individual activation failures are logged so one broken plugin does
    /// not prevent the daemon from starting.
    ///
    /// # Errors
    ///
    /// Only the directory scan itself can fail.
    pub async fn load(&self) -> Result<()> {
        for descriptor in self.registry.plugins()? {
            if let Err(e) = self.get(&descriptor.name).await {
                warn!(plugin = %descriptor.name, error = %e, "plugin activation failed");
            }
        }
        Ok(())
    }

    fn cached_or_discover(&self, name: &str) -> Result<Arc<Plugin>> {
        let mut plugins = self
            .plugins
            .lock()
            .map_err(|_| CommonError::internal("plugin store lock poisoned"))?;
        if let Some(plugin) = plugins.get(name) {
            return Ok(plugin.clone());
        }
        let descriptor = self.registry.plugin(name)?;
        let plugin = Arc::new(Plugin::new(&descriptor)?);
        plugins.insert(name.to_string(), plugin.clone());
        Ok(plugin)
    }

    async fn activate(&self, plugin: &Arc<Plugin>) -> Result<()> {
        plugin
            .manifest
            .get_or_try_init(|| async {
                let manifest: Manifest = plugin.client.call_empty(ACTIVATE_METHOD).await?;
                debug!(
                    plugin = %plugin.name,
                    implements = ?manifest.implements,
                    "plugin activated"
                );
                self.dispatch(plugin, &manifest);
                Ok::<_, PluginError>(manifest)
            })
            .await?;
        Ok(())
    }

    /// Dispatches each advertised capability to its handler. The handler
    /// snapshot is taken under the handler mutex and invoked outside it;
    /// capabilities with no handler are ignored.
    fn dispatch(&self, plugin: &Plugin, manifest: &Manifest) {
        for capability in &manifest.implements {
            let handler = self
                .handlers
                .lock()
                .ok()
                .and_then(|handlers| handlers.get(capability).cloned());
            match handler {
                Some(handler) => handler(&plugin.name, plugin.client.clone()),
                None => {
                    debug!(plugin = %plugin.name, capability = %capability, "no handler registered");
                }
            }
        }
    }
}
