//! # vessel-container
//!
//! Container-side volume lifecycle for the vessel daemon.
//!
//! This crate turns a container's declared `Volumes`, `Binds`, and
//! `VolumesFrom` into an ordered, deduplicated set of mount points, wires
//! the resolved volumes into create/start/remove, and persists the result
//! so containers reattach to their volumes after a daemon restart.
//!
//! ```text
//! config.Volumes ─┐
//! hostcfg.Binds ──┼─▶ resolve ─▶ MountPoints ─▶ reference volumes
//! VolumesFrom ────┘   (C7)        (persisted)    mount + sort (start)
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod container;
pub mod daemon;
pub mod error;
pub mod mounts;
pub mod rootfs;

pub use config::{ContainerConfig, HostConfig};
pub use container::{Container, ContainerId, ContainerState};
pub use daemon::Daemon;
pub use error::{ContainerError, Result};
pub use mounts::{BindSpec, MountPoint, RuntimeMount};
