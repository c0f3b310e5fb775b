//! The hide worker.
//!
//! A worker is bound to one suspended process. It enters that process's
//! mount namespace, detaches the overlay mounts, resumes the process and
//! lingers for a settle delay so the footprint stays hidden while the
//! process initialises. It runs as its own OS process: `setns` into a mount
//! namespace is refused for multithreaded callers.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use veil_common::{VeilPaths, VeilResult};

use super::process::{HostProcesses, ProcessControl};
use super::protocol::{CacheBlock, WorkerReport, WorkerRequest};
use crate::filesystem::{self, MountRecord, UnmountPolicy};
use crate::namespace;

/// Mount operations a worker performs.
pub trait MountOps {
    /// Move the calling thread into the mount namespace of `pid`.
    fn enter_namespace(&self, pid: u32) -> VeilResult<()>;

    /// Current mount table of `pid`.
    fn mount_table(&self, pid: u32) -> VeilResult<Vec<MountRecord>>;

    /// Lazily unmount `mountpoint`.
    fn detach(&self, mountpoint: &str) -> VeilResult<()>;
}

/// [`MountOps`] acting on the host kernel.
#[derive(Debug, Clone, Default)]
pub struct HostMounts {
    paths: VeilPaths,
}

impl HostMounts {
    /// Create host mount operations over the given procfs tree.
    #[must_use]
    pub fn new(paths: VeilPaths) -> Self {
        Self { paths }
    }
}

impl MountOps for HostMounts {
    fn enter_namespace(&self, pid: u32) -> VeilResult<()> {
        namespace::join_mount_namespace(&self.paths, pid)
    }

    fn mount_table(&self, pid: u32) -> VeilResult<Vec<MountRecord>> {
        filesystem::read_mount_table(&self.paths.mounts(pid))
    }

    fn detach(&self, mountpoint: &str) -> VeilResult<()> {
        filesystem::detach(Path::new(mountpoint))
    }
}

/// One run of the hide procedure.
pub struct Worker<'a> {
    mounts: &'a dyn MountOps,
    processes: &'a dyn ProcessControl,
}

impl<'a> Worker<'a> {
    /// Create a worker over the given operations.
    pub fn new(mounts: &'a dyn MountOps, processes: &'a dyn ProcessControl) -> Self {
        Self { mounts, processes }
    }

    /// Hide the overlay from `request.target_pid` and resume it.
    ///
    /// Never fails: every step tolerates errors, and the target is resumed
    /// whatever happened before.
    pub fn run(&self, request: &WorkerRequest) -> WorkerReport {
        let pid = request.target_pid;
        let mut report = WorkerReport::new(pid, request.cache.clone());

        match self.mounts.enter_namespace(pid) {
            Ok(()) => {
                report.joined = true;
                self.unmount_overlay(&request.policy, &mut report);
            }
            Err(e) => tracing::warn!(pid, error = %e, "Cannot enter mount namespace"),
        }

        match self.processes.resume(pid) {
            Ok(()) => report.resumed = true,
            Err(e) => tracing::warn!(pid, error = %e, "Failed to resume target"),
        }

        tracing::info!(
            pid,
            unmounted = report.unmounted.len(),
            failed = report.failed.len(),
            "Overlay hidden from process"
        );

        if request.settle_ms > 0 {
            std::thread::sleep(Duration::from_millis(request.settle_ms));
        }
        report
    }

    fn unmount_overlay(&self, policy: &UnmountPolicy, report: &mut WorkerReport) {
        let pid = report.target_pid;
        let table = match self.mounts.mount_table(pid) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(pid, error = %e, "Cannot read mount table");
                return;
            }
        };

        if !report.cache.is_known() {
            report.cache = match policy.discover_cache_block(&table) {
                Some(device) => {
                    tracing::debug!(device = %device, "Discovered cache block");
                    CacheBlock::Device(device)
                }
                None => {
                    tracing::debug!(
                        mountpoint = %policy.cache_mountpoint,
                        "No cache mount, skipping cache unmounts"
                    );
                    CacheBlock::Absent
                }
            };
        }

        if let Some(block) = report.cache.device() {
            let targets = policy.cache_targets(&table, block);
            self.detach_all(targets, report);
        }
        self.detach_all(policy.tmpfs_targets(&table), report);

        // Loop mounts are only reliably visible once the bind mounts are gone
        match self.mounts.mount_table(pid) {
            Ok(table) => self.detach_all(policy.loop_targets(&table), report),
            Err(e) => tracing::warn!(pid, error = %e, "Cannot re-read mount table"),
        }
    }

    fn detach_all(&self, targets: Vec<String>, report: &mut WorkerReport) {
        for mountpoint in targets {
            match self.mounts.detach(&mountpoint) {
                Ok(()) => {
                    tracing::debug!(mountpoint = %mountpoint, "Unmounted");
                    report.unmounted.push(mountpoint);
                }
                Err(e) => {
                    tracing::debug!(mountpoint = %mountpoint, error = %e, "Unmount failed");
                    report.failed.push(mountpoint);
                }
            }
        }
    }
}

/// Worker entry point: read a request from stdin, run it against the host
/// and write the report to stdout.
pub fn serve_stdio() -> VeilResult<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let request: WorkerRequest = serde_json::from_str(&input)?;

    let paths = VeilPaths::default();
    let mounts = HostMounts::new(paths.clone());
    let processes = HostProcesses::new(paths);
    let report = Worker::new(&mounts, &processes).run(&request);

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &report)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}
