#![allow(unsafe_code)]
//! Mount namespace identity and joining.

use std::fmt;
use std::os::unix::io::AsRawFd;

use serde::{Deserialize, Serialize};
use veil_common::{VeilError, VeilPaths, VeilResult};

/// Identity of one mount namespace instance.
///
/// This is the resolved target of `/proc/<pid>/ns/mnt`, e.g.
/// `mnt:[4026531840]`. Two processes share a namespace exactly when their
/// fingerprints are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceFingerprint(String);

impl NamespaceFingerprint {
    /// Wrap an already resolved namespace handle.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read the mount namespace fingerprint of `pid`.
///
/// Fails with [`VeilError::NamespaceUnsupported`] when the handle cannot be
/// resolved, either because the kernel lacks namespace support or because the
/// process is already gone.
pub fn read_namespace(paths: &VeilPaths, pid: u32) -> VeilResult<NamespaceFingerprint> {
    let path = paths.mount_namespace(pid);
    match std::fs::read_link(&path) {
        Ok(target) => Ok(NamespaceFingerprint(target.to_string_lossy().into_owned())),
        Err(e) => {
            tracing::trace!(
                pid,
                path = %path.display(),
                error = %e,
                "Cannot resolve mount namespace"
            );
            Err(VeilError::NamespaceUnsupported { pid })
        }
    }
}

/// Move the calling process into the mount namespace of `pid`.
///
/// The kernel refuses this for multithreaded callers, which is why the hide
/// worker runs as its own single-threaded process.
#[cfg(target_os = "linux")]
pub fn join_mount_namespace(paths: &VeilPaths, pid: u32) -> VeilResult<()> {
    let path = paths.mount_namespace(pid);
    let handle =
        std::fs::File::open(&path).map_err(|e| VeilError::from_process_io(pid, e))?;

    if unsafe { libc::setns(handle.as_raw_fd(), libc::CLONE_NEWNS) } != 0 {
        let err = std::io::Error::last_os_error();
        return Err(VeilError::from_process_io(pid, err));
    }

    tracing::debug!(pid, path = %path.display(), "Joined mount namespace");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn join_mount_namespace(_paths: &VeilPaths, pid: u32) -> VeilResult<()> {
    Err(VeilError::NamespaceUnsupported { pid })
}
