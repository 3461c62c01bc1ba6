//! Rootfs-scoped path resolution and initial volume content.

use crate::error::Result;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use vessel_error::CommonError;
use vessel_volume::paths;

const MAX_SYMLINK_DEPTH: usize = 255;

/// Resolves `path` as a process inside the rootfs would see it: symlinks
/// are followed within the scope of `root`, and `..` never climbs above it,
/// as though `root` were `/`.
///
/// # Errors
///
/// `InvalidState` on a symlink cycle; filesystem failures reading links.
pub fn resolve_in_scope(root: &Path, path: &Path) -> Result<PathBuf> {
    let clean = paths::clean(&Path::new("/").join(path));
    let mut queue: VecDeque<OsString> = clean
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            _ => None,
        })
        .collect();

    let mut resolved = root.to_path_buf();
    let mut followed = 0usize;

    while let Some(part) = queue.pop_front() {
        if part == ".." {
            if resolved != root {
                resolved.pop();
            }
            continue;
        }

        let candidate = resolved.join(&part);
        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                followed += 1;
                if followed > MAX_SYMLINK_DEPTH {
                    return Err(CommonError::invalid_state(format!(
                        "too many levels of symbolic links resolving {}",
                        path.display()
                    ))
                    .into());
                }
                let target = fs::read_link(&candidate).map_err(CommonError::from)?;
                if target.is_absolute() {
                    resolved = root.to_path_buf();
                }
                let mut parts = Vec::new();
                for component in target.components() {
                    match component {
                        Component::Normal(name) => parts.push(name.to_os_string()),
                        Component::ParentDir => parts.push(OsString::from("..")),
                        _ => {}
                    }
                }
                for component in parts.into_iter().rev() {
                    queue.push_front(component);
                }
            }
            // Missing components resolve lexically from here on.
            _ => resolved = candidate,
        }
    }
    Ok(resolved)
}

/// Translates a host-side resolved path back into the in-container
/// destination it represents.
#[must_use]
pub fn scoped_destination(root: &Path, resolved: &Path) -> PathBuf {
    resolved
        .strip_prefix(root)
        .map_or_else(|_| resolved.to_path_buf(), |rest| Path::new("/").join(rest))
}

/// Seeds an empty volume directory from the rootfs content at the
/// destination, preserving mode and ownership.
///
/// Nothing is copied unless the source has entries and the destination has
/// none; ownership of the top directory is aligned either way.
///
/// # Errors
///
/// Filesystem failures.
pub fn copy_existing_contents(source: &Path, destination: &Path) -> Result<()> {
    if !source.is_dir() || !destination.is_dir() {
        return Ok(());
    }
    if !dir_is_empty(source)? && dir_is_empty(destination)? {
        copy_tree(source, destination)?;
    }
    copy_ownership(source, destination)
}

fn dir_is_empty(path: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(path).map_err(CommonError::from)?;
    Ok(entries.next().is_none())
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    for entry in fs::read_dir(source).map_err(CommonError::from)? {
        let entry = entry.map_err(CommonError::from)?;
        let from = entry.path();
        let to = destination.join(entry.file_name());
        let file_type = entry.file_type().map_err(CommonError::from)?;

        if file_type.is_dir() {
            fs::create_dir(&to).map_err(CommonError::from)?;
            copy_tree(&from, &to)?;
            copy_ownership(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from).map_err(CommonError::from)?;
            std::os::unix::fs::symlink(target, &to).map_err(CommonError::from)?;
        } else {
            fs::copy(&from, &to).map_err(CommonError::from)?;
            copy_ownership(&from, &to)?;
        }
    }
    Ok(())
}

/// Aligns mode and ownership of `to` with `from`.
fn copy_ownership(from: &Path, to: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(from).map_err(CommonError::from)?;
    fs::set_permissions(to, meta.permissions()).map_err(CommonError::from)?;
    nix::unistd::chown(
        to,
        Some(nix::unistd::Uid::from_raw(meta.uid())),
        Some(nix::unistd::Gid::from_raw(meta.gid())),
    )
    .map_err(std::io::Error::from)
    .map_err(CommonError::from)?;
    Ok(())
}
