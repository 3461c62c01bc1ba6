//! Plugin discovery from the local plugin directory.
//!
//! A plugin announces itself by dropping a file into the plugin directory:
//! a Unix socket `<name>.sock`, or a `<name>.spec` (or bare `<name>`) file
//! whose content is the endpoint address.

use crate::client::PluginAddr;
use crate::error::{PluginError, Result};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use vessel_error::CommonError;

/// Default directory scanned for plugin sockets and spec files.
pub const DEFAULT_PLUGIN_DIR: &str = "/usr/share/vessel/plugins";

/// A discovered, not yet activated plugin endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// Plugin name, taken from the file name.
    pub name: String,
    /// Endpoint address, `unix://...` or `tcp://...`.
    pub addr: String,
}

/// Scans a directory for plugin endpoints.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    path: PathBuf,
}

impl Default for LocalRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PLUGIN_DIR)
    }
}

impl LocalRegistry {
    /// Creates a registry over the given directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns every plugin the directory advertises, without activating any.
    ///
    /// The scan is non-recursive. A file that cannot be parsed as a plugin
    /// endpoint fails the whole scan.
    ///
    /// # Errors
    ///
    /// `NotFound` when the directory is missing; I/O errors (permissions
    /// included) propagate unchanged; `UnknownProtocol` for addresses with a
    /// missing or unsupported scheme.
    pub fn plugins(&self) -> Result<Vec<PluginDescriptor>> {
        let entries = fs::read_dir(&self.path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                PluginError::not_found(format!("plugin directory {}", self.path.display()))
            } else {
                PluginError::from(e)
            }
        })?;

        let mut plugins = Vec::new();
        for entry in entries {
            let entry = entry.map_err(CommonError::from)?;
            let file_type = entry.file_type().map_err(CommonError::from)?;
            if file_type.is_dir() {
                continue;
            }
            plugins.push(read_plugin_info(&entry.path(), &file_type)?);
        }
        Ok(plugins)
    }

    /// Returns a single dormant plugin by name.
    ///
    /// # Errors
    ///
    /// `NotFound` when no file in the directory names the plugin, plus any
    /// scan error.
    pub fn plugin(&self, name: &str) -> Result<PluginDescriptor> {
        self.plugins()?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PluginError::not_found(format!("plugin {name}")))
    }
}

fn read_plugin_info(path: &Path, file_type: &fs::FileType) -> Result<PluginDescriptor> {
    let name = plugin_name(path);
    if file_type.is_socket() {
        return Ok(PluginDescriptor {
            name,
            addr: format!("unix://{}", path.display()),
        });
    }

    let content = fs::read_to_string(path).map_err(CommonError::from)?;
    let addr = content.trim().to_string();
    PluginAddr::parse(&addr)?;
    Ok(PluginDescriptor { name, addr })
}

/// File name up to the first dot: `echo.sock` and `echo.spec` both name
/// the plugin `echo`.
fn plugin_name(path: &Path) -> String {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    file_name.split('.').next().unwrap_or(file_name).to_string()
}
