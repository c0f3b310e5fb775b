//! Linux mount namespace handling.
//!
//! This module provides:
//! - Namespace fingerprints read from `/proc/<pid>/ns/mnt`
//! - Joining another process's mount namespace
//! - Discovery of the spawner (zygote) namespaces at startup

mod mount;
mod spawner;

pub use mount::{NamespaceFingerprint, join_mount_namespace, read_namespace};
pub use spawner::{SpawnerSet, locate_spawners};
