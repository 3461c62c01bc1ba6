//! Mount points and the bind specification grammar.

use crate::error::{ContainerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vessel_error::CommonError;
use vessel_volume::{paths, Volume};

fn valid_mode(mode: &str) -> bool {
    matches!(mode, "ro" | "rw")
}

/// A container's bound use of a volume at a destination.
///
/// The serialized form is what the container record persists under
/// `MountPoints`; the live volume handle is re-established from the
/// repository after a daemon restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountPoint {
    /// Volume name; empty for literal host-path binds.
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Absolute, cleaned path inside the container.
    #[serde(rename = "Destination")]
    pub destination: PathBuf,
    /// Owning driver; empty for literal host-path binds.
    #[serde(rename = "Driver", default)]
    pub driver: String,
    /// Whether the container may write through the mount.
    #[serde(rename = "RW")]
    pub rw: bool,
    /// Literal host path for bind mounts.
    #[serde(rename = "Source", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Live volume handle.
    #[serde(skip)]
    pub volume: Option<Arc<Volume>>,
}

impl MountPoint {
    /// Host-side path backing this mount, when known.
    #[must_use]
    pub fn source_path(&self) -> Option<PathBuf> {
        if let Some(volume) = &self.volume {
            return Some(volume.path().to_path_buf());
        }
        self.source.clone()
    }

    /// Prepares the mount and returns the host path to bind.
    ///
    /// # Errors
    ///
    /// Driver failures, or `InvalidState` when the mount has neither a
    /// volume nor a source path.
    pub async fn setup(&self) -> Result<PathBuf> {
        if let Some(volume) = &self.volume {
            return Ok(volume.mount().await?);
        }
        if let Some(source) = &self.source {
            if !source.exists() {
                std::fs::create_dir_all(source).map_err(CommonError::from)?;
            }
            return Ok(source.clone());
        }
        Err(CommonError::invalid_state(format!(
            "mount point {} has neither source nor volume",
            self.destination.display()
        ))
        .into())
    }
}

/// Parsed `<source>:<dest>[:ro|rw]` bind specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// Volume name, when the source is not an absolute path.
    pub name: Option<String>,
    /// Host path, when the source is absolute.
    pub source: Option<PathBuf>,
    /// Cleaned absolute in-container destination.
    pub destination: PathBuf,
    /// Mode grants writes; defaults to `rw`.
    pub rw: bool,
}

/// Parses a bind specification.
///
/// # Errors
///
/// `InvalidSpec` for a malformed string, bad mode, or relative destination.
pub fn parse_bind_spec(spec: &str) -> Result<BindSpec> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, destination, rw) = match parts.as_slice() {
        [source, destination] => (*source, *destination, true),
        [source, destination, mode] => {
            if !valid_mode(mode) {
                return Err(ContainerError::InvalidSpec(spec.to_string()));
            }
            (*source, *destination, *mode == "rw")
        }
        _ => return Err(ContainerError::InvalidSpec(spec.to_string())),
    };

    if source.is_empty() || destination.is_empty() {
        return Err(ContainerError::InvalidSpec(spec.to_string()));
    }
    let destination = paths::clean(Path::new(destination));
    if !destination.is_absolute() {
        return Err(ContainerError::InvalidSpec(spec.to_string()));
    }

    let source_path = Path::new(source);
    if source_path.is_absolute() {
        Ok(BindSpec {
            name: None,
            source: Some(paths::clean(source_path)),
            destination,
            rw,
        })
    } else {
        Ok(BindSpec {
            name: Some(source.to_string()),
            source: None,
            destination,
            rw,
        })
    }
}

/// Parses a volumes-from specification, returning the peer id and whether
/// the mode grants writes (default `rw`).
///
/// # Errors
///
/// `InvalidSpec` for an empty id or a bad mode.
pub fn parse_volumes_from(spec: &str) -> Result<(String, bool)> {
    let (id, mode) = spec.split_once(':').unwrap_or((spec, "rw"));
    if id.is_empty() || !valid_mode(mode) {
        return Err(ContainerError::InvalidSpec(spec.to_string()));
    }
    Ok((id.to_string(), mode == "rw"))
}

/// Mount entry handed to the low-level runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeMount {
    /// Host-side path.
    pub source: PathBuf,
    /// In-container destination.
    pub destination: PathBuf,
    /// Whether the container may write through the mount.
    pub writable: bool,
    /// Private mounts are not shared with peers.
    pub private: bool,
}

/// Orders mounts by destination depth so parents are applied before
/// children.
pub fn sort_mounts(mounts: &mut [RuntimeMount]) {
    mounts.sort_by_key(|m| paths::clean(&m.destination).components().count());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_spec_defaults_to_read_write() {
        let bind = parse_bind_spec("/host/data:/data").unwrap();
        assert_eq!(bind.source, Some(PathBuf::from("/host/data")));
        assert_eq!(bind.name, None);
        assert_eq!(bind.destination, PathBuf::from("/data"));
        assert!(bind.rw);
    }

    #[test]
    fn bind_spec_parses_modes() {
        assert!(!parse_bind_spec("/host:/data:ro").unwrap().rw);
        assert!(parse_bind_spec("/host:/data:rw").unwrap().rw);
        assert!(matches!(
            parse_bind_spec("/host:/data:rx"),
            Err(ContainerError::InvalidSpec(_))
        ));
    }

    #[test]
    fn bind_spec_relative_source_is_a_volume_name() {
        let bind = parse_bind_spec("dbdata:/var/lib/db").unwrap();
        assert_eq!(bind.name, Some("dbdata".to_string()));
        assert_eq!(bind.source, None);
    }

    #[test]
    fn bind_spec_cleans_destination() {
        let bind = parse_bind_spec("/host:/data/./logs/../db").unwrap();
        assert_eq!(bind.destination, PathBuf::from("/data/db"));
    }

    #[test]
    fn bind_spec_rejects_malformed_strings() {
        for spec in ["/only-source", "/a:/b:rw:extra", ":/data", "/host:", "name:relative"] {
            assert!(
                matches!(parse_bind_spec(spec), Err(ContainerError::InvalidSpec(_))),
                "expected InvalidSpec for {spec:?}"
            );
        }
    }

    #[test]
    fn volumes_from_defaults_to_read_write() {
        assert_eq!(parse_volumes_from("abc123").unwrap(), ("abc123".to_string(), true));
        assert_eq!(parse_volumes_from("abc123:ro").unwrap(), ("abc123".to_string(), false));
        assert_eq!(parse_volumes_from("abc123:rw").unwrap(), ("abc123".to_string(), true));
        assert!(matches!(
            parse_volumes_from("abc123:rx"),
            Err(ContainerError::InvalidSpec(_))
        ));
        assert!(matches!(
            parse_volumes_from(":ro"),
            Err(ContainerError::InvalidSpec(_))
        ));
    }

    #[test]
    fn sort_orders_parents_before_children() {
        let mount = |dest: &str| RuntimeMount {
            source: PathBuf::from("/src"),
            destination: PathBuf::from(dest),
            writable: true,
            private: false,
        };
        let mut mounts = vec![mount("/a/b/c"), mount("/a"), mount("/a/b"), mount("/etc/hosts")];
        sort_mounts(&mut mounts);

        let depths: Vec<usize> = mounts
            .iter()
            .map(|m| m.destination.components().count())
            .collect();
        let mut sorted = depths.clone();
        sorted.sort_unstable();
        assert_eq!(depths, sorted);
        assert_eq!(mounts[0].destination, PathBuf::from("/a"));
    }
}
