//! Remote driver adapter speaking the plugin wire protocol.

use crate::driver::VolumeDriver;
use crate::error::{Result, VolumeError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use vessel_plugins::PluginClient;

#[derive(Serialize)]
struct VolumeRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
}

#[derive(Deserialize, Default)]
struct VolumeResponse {
    #[serde(rename = "Err", default)]
    err: String,
}

#[derive(Deserialize, Default)]
struct MountpointResponse {
    #[serde(rename = "Mountpoint", default)]
    mountpoint: String,
    #[serde(rename = "Err", default)]
    err: String,
}

#[derive(Debug)]
struct MountRef {
    count: usize,
    mountpoint: PathBuf,
}

/// Volume driver backed by an activated plugin.
///
/// Mount and unmount are reference counted per volume name: several
/// containers sharing one volume produce a single remote materialization,
/// torn down when the last user unmounts.
#[derive(Debug)]
pub struct PluginDriver {
    name: String,
    client: PluginClient,
    mounts: tokio::sync::Mutex<HashMap<String, MountRef>>,
}

impl PluginDriver {
    /// Creates an adapter for the named plugin.
    #[must_use]
    pub fn new(name: impl Into<String>, client: PluginClient) -> Self {
        Self {
            name: name.into(),
            client,
            mounts: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, err: String) -> Result<()> {
        if err.is_empty() {
            Ok(())
        } else {
            Err(VolumeError::Driver {
                driver: self.name.clone(),
                message: err,
            })
        }
    }
}

#[async_trait]
impl VolumeDriver for PluginDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, name: &str) -> Result<()> {
        let response: VolumeResponse = self
            .client
            .call("VolumeDriver.Create", &VolumeRequest { name })
            .await?;
        self.check(response.err)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let response: VolumeResponse = self
            .client
            .call("VolumeDriver.Remove", &VolumeRequest { name })
            .await?;
        self.check(response.err)
    }

    async fn path(&self, name: &str) -> Result<PathBuf> {
        let response: MountpointResponse = self
            .client
            .call("VolumeDriver.Path", &VolumeRequest { name })
            .await?;
        self.check(response.err)?;
        Ok(PathBuf::from(response.mountpoint))
    }

    async fn mount(&self, name: &str) -> Result<PathBuf> {
        let mut mounts = self.mounts.lock().await;
        if let Some(held) = mounts.get_mut(name) {
            held.count += 1;
            return Ok(held.mountpoint.clone());
        }

        let response: MountpointResponse = self
            .client
            .call("VolumeDriver.Mount", &VolumeRequest { name })
            .await?;
        self.check(response.err)?;
        let mountpoint = PathBuf::from(response.mountpoint);
        mounts.insert(
            name.to_string(),
            MountRef {
                count: 1,
                mountpoint: mountpoint.clone(),
            },
        );
        Ok(mountpoint)
    }

    async fn unmount(&self, name: &str) -> Result<()> {
        let mut mounts = self.mounts.lock().await;
        match mounts.get_mut(name) {
            Some(held) if held.count > 1 => {
                held.count -= 1;
                Ok(())
            }
            Some(_) => {
                mounts.remove(name);
                let response: VolumeResponse = self
                    .client
                    .call("VolumeDriver.Unmount", &VolumeRequest { name })
                    .await?;
                self.check(response.err)
            }
            // Unmount without a held mount: nothing to release.
            None => Ok(()),
        }
    }
}
