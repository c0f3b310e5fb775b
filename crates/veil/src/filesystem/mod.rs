//! Filesystem operations.
//!
//! This module handles:
//! - Mount table parsing and lazy unmounts
//! - Selection of overlay mounts
//! - Hiding and restoring the installation footprint

mod footprint;
mod mounts;
mod policy;

pub use footprint::{Footprint, FootprintToggle, Marker, MarkerFootprint};
pub use mounts::{MountRecord, detach, parse_mount_table, read_mount_table, remount};
pub use policy::UnmountPolicy;
