//! Built-in host-directory volume driver.

use crate::driver::{VolumeDriver, LOCAL_DRIVER_NAME};
use crate::error::Result;
use async_trait::async_trait;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use vessel_error::CommonError;

/// Stores each volume as a directory named after it under a configured root.
///
/// Mount and unmount are free: the directory is the materialization.
#[derive(Debug)]
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    /// Creates a driver rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn volume_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl VolumeDriver for LocalDriver {
    fn name(&self) -> &str {
        LOCAL_DRIVER_NAME
    }

    async fn create(&self, name: &str) -> Result<()> {
        let path = self.volume_path(name);
        if path.is_dir() {
            return Ok(());
        }
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true).mode(0o755);
        builder.create(&path).map_err(CommonError::from)?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_dir_all(self.volume_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CommonError::from(e).into()),
        }
    }

    async fn path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.volume_path(name))
    }

    async fn mount(&self, name: &str) -> Result<PathBuf> {
        Ok(self.volume_path(name))
    }

    async fn unmount(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}
