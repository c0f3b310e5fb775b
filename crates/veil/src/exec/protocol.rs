//! Messages exchanged between the monitor and a hide worker.
//!
//! The monitor writes one [`WorkerRequest`] as JSON to the worker's stdin and
//! reads one [`WorkerReport`] back from its stdout.

use serde::{Deserialize, Serialize};

use crate::filesystem::UnmountPolicy;

/// What is known about the device backing the overlay cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "device", rename_all = "snake_case")]
pub enum CacheBlock {
    /// Not discovered yet; the worker looks it up in its target's mount table.
    #[default]
    Unknown,
    /// The device path, e.g. `/dev/block/mmcblk0p23`.
    Device(String),
    /// Discovery ran and found no cache mount; cache unmounting is skipped.
    Absent,
}

impl CacheBlock {
    /// Whether discovery has already run.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// The device path, if one was found.
    #[must_use]
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::Device(device) => Some(device),
            Self::Unknown | Self::Absent => None,
        }
    }
}

/// Work order for one frozen process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// The suspended process.
    pub target_pid: u32,
    /// Cache device as known to the monitor.
    #[serde(default)]
    pub cache: CacheBlock,
    /// Which mounts to remove.
    #[serde(default)]
    pub policy: UnmountPolicy,
    /// Delay after resuming the target before the worker exits (milliseconds).
    #[serde(default)]
    pub settle_ms: u64,
}

impl WorkerRequest {
    /// Request for `target_pid` with default policy and no settle delay.
    #[must_use]
    pub fn new(target_pid: u32) -> Self {
        Self {
            target_pid,
            cache: CacheBlock::Unknown,
            policy: UnmountPolicy::default(),
            settle_ms: 0,
        }
    }
}

/// What a worker did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// The process the worker was bound to.
    pub target_pid: u32,
    /// Cache device after discovery; the monitor remembers it.
    pub cache: CacheBlock,
    /// Whether the worker entered the target's mount namespace.
    pub joined: bool,
    /// Mountpoints detached, in order.
    pub unmounted: Vec<String>,
    /// Mountpoints whose detach failed.
    pub failed: Vec<String>,
    /// Whether the continue signal reached the target.
    pub resumed: bool,
}

impl WorkerReport {
    /// Empty report for `target_pid`.
    #[must_use]
    pub fn new(target_pid: u32, cache: CacheBlock) -> Self {
        Self {
            target_pid,
            cache,
            joined: false,
            unmounted: Vec::new(),
            failed: Vec::new(),
            resumed: false,
        }
    }
}
