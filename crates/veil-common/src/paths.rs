//! Standard procfs paths used by veil.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default procfs mount point.
pub static PROC_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VEIL_PROC_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/proc"))
});

/// Per-process procfs locations.
#[derive(Debug, Clone)]
pub struct VeilPaths {
    /// procfs root (default: /proc).
    pub proc: PathBuf,
}

impl VeilPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths rooted at a custom procfs directory.
    #[must_use]
    pub fn with_proc_root(proc: impl Into<PathBuf>) -> Self {
        Self { proc: proc.into() }
    }

    /// Directory for a single process.
    #[must_use]
    pub fn process(&self, pid: u32) -> PathBuf {
        self.proc.join(pid.to_string())
    }

    /// Mount namespace handle of a process.
    #[must_use]
    pub fn mount_namespace(&self, pid: u32) -> PathBuf {
        self.process(pid).join("ns").join("mnt")
    }

    /// Mount table of a process as seen from its namespace.
    #[must_use]
    pub fn mounts(&self, pid: u32) -> PathBuf {
        self.process(pid).join("mounts")
    }

    /// Command line of a process.
    #[must_use]
    pub fn cmdline(&self, pid: u32) -> PathBuf {
        self.process(pid).join("cmdline")
    }

    /// Short command name of a process.
    #[must_use]
    pub fn comm(&self, pid: u32) -> PathBuf {
        self.process(pid).join("comm")
    }

    /// The procfs root itself.
    #[must_use]
    pub fn proc_root(&self) -> &Path {
        &self.proc
    }
}

impl Default for VeilPaths {
    fn default() -> Self {
        Self {
            proc: PROC_ROOT.clone(),
        }
    }
}
