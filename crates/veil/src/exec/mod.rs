//! Process control and hide workers.
//!
//! This module handles:
//! - Stopping, continuing and finding processes
//! - The request/report protocol between monitor and worker
//! - Launching workers and the worker procedure itself

mod launcher;
mod process;
mod protocol;
mod worker;

pub use launcher::{ProcessLauncher, WorkerLauncher};
pub use process::{HostProcesses, ProcessControl, send_signal};
pub use protocol::{CacheBlock, WorkerReport, WorkerRequest};
pub use worker::{HostMounts, MountOps, Worker, serve_stdio};
