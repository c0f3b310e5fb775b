#![allow(unsafe_code)]
//! Process control: namespace reads, stop/continue signals and lookup by name.

use veil_common::{VeilError, VeilPaths, VeilResult};

use crate::namespace::{self, NamespaceFingerprint};

/// Operations the monitor and the worker perform on other processes.
///
/// The host implementation talks to procfs and the kernel; tests substitute
/// scripted fakes to reproduce fork and unshare races deterministically.
pub trait ProcessControl: Send + Sync {
    /// Read the mount namespace fingerprint of `pid`.
    fn read_namespace(&self, pid: u32) -> VeilResult<NamespaceFingerprint>;

    /// Pids of every running process named `name`.
    fn find_by_name(&self, name: &str) -> VeilResult<Vec<u32>>;

    /// Stop `pid` (SIGSTOP).
    fn suspend(&self, pid: u32) -> VeilResult<()>;

    /// Continue `pid` (SIGCONT).
    fn resume(&self, pid: u32) -> VeilResult<()>;
}

/// [`ProcessControl`] backed by procfs and `kill(2)`.
#[derive(Debug, Clone, Default)]
pub struct HostProcesses {
    paths: VeilPaths,
}

impl HostProcesses {
    /// Create a controller reading the given procfs tree.
    #[must_use]
    pub fn new(paths: VeilPaths) -> Self {
        Self { paths }
    }

    /// The procfs paths in use.
    #[must_use]
    pub fn paths(&self) -> &VeilPaths {
        &self.paths
    }

    /// The name a process was started under: `argv[0]`, or `comm` for
    /// processes with an empty command line.
    fn process_name(&self, pid: u32) -> Option<String> {
        let cmdline = std::fs::read(self.paths.cmdline(pid)).ok()?;
        let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
        if !argv0.is_empty() {
            return Some(String::from_utf8_lossy(argv0).into_owned());
        }

        std::fs::read_to_string(self.paths.comm(pid))
            .ok()
            .map(|comm| comm.trim_end().to_string())
    }
}

impl ProcessControl for HostProcesses {
    fn read_namespace(&self, pid: u32) -> VeilResult<NamespaceFingerprint> {
        namespace::read_namespace(&self.paths, pid)
    }

    fn find_by_name(&self, name: &str) -> VeilResult<Vec<u32>> {
        let mut pids = Vec::new();

        for entry in std::fs::read_dir(self.paths.proc_root())? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };

            // Processes may exit while we scan
            if self.process_name(pid).as_deref() == Some(name) {
                pids.push(pid);
            }
        }

        pids.sort_unstable();
        tracing::trace!(name, ?pids, "Scanned processes by name");
        Ok(pids)
    }

    fn suspend(&self, pid: u32) -> VeilResult<()> {
        send_signal(pid, libc::SIGSTOP)
    }

    fn resume(&self, pid: u32) -> VeilResult<()> {
        send_signal(pid, libc::SIGCONT)
    }
}

/// Deliver `signal` to exactly one process.
pub fn send_signal(pid: u32, signal: libc::c_int) -> VeilResult<()> {
    // pid 0 and negative pids address process groups
    let raw = match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => {
            return Err(VeilError::Internal {
                message: format!("refusing to signal pid {pid}"),
            });
        }
    };

    tracing::trace!(pid, signal, "Sending signal");

    if unsafe { libc::kill(raw, signal) } != 0 {
        return Err(VeilError::from_process_io(
            pid,
            std::io::Error::last_os_error(),
        ));
    }

    Ok(())
}
