//! Scripted fakes for driving the monitor without touching the host.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use veil::exec::{CacheBlock, ProcessControl, WorkerLauncher, WorkerReport, WorkerRequest};
use veil::filesystem::FootprintToggle;
use veil::namespace::NamespaceFingerprint;
use veil::runtime::{HideConfig, Monitor, Pacing, ProcessNotification};
use veil_common::{VeilError, VeilResult};

/// Init namespace used by every scenario.
pub const INIT_NS: &str = "mnt:[4026531840]";
/// Namespace of the primary spawner.
pub const ZYGOTE_NS: &str = "mnt:[4026532100]";
/// Namespace of the secondary spawner.
pub const ZYGOTE64_NS: &str = "mnt:[4026532101]";

/// Signals observed by [`FakeProcesses`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Stop,
    Cont,
}

/// Namespace reads step through a script; the last entry repeats. `None`
/// reads fail as if the process had exited.
#[derive(Default)]
pub struct FakeProcesses {
    namespaces: Mutex<HashMap<u32, VecDeque<Option<String>>>>,
    names: Mutex<HashMap<String, VecDeque<Vec<u32>>>>,
    signals: Mutex<Vec<(u32, Signal)>>,
    gone: Mutex<Vec<u32>>,
}

impl FakeProcesses {
    pub fn new() -> Arc<Self> {
        let processes = Self::default();
        processes.script(1, [Some(INIT_NS)]);
        Arc::new(processes)
    }

    pub fn script<const N: usize>(&self, pid: u32, reads: [Option<&str>; N]) {
        self.namespaces
            .lock()
            .insert(pid, reads.iter().map(|r| r.map(ToString::to_string)).collect());
    }

    pub fn name_lookups<const N: usize>(&self, name: &str, lookups: [&[u32]; N]) {
        self.names
            .lock()
            .insert(name.to_string(), lookups.iter().map(|l| l.to_vec()).collect());
    }

    /// Make signals to `pid` fail with `ESRCH`.
    pub fn exit(&self, pid: u32) {
        self.gone.lock().push(pid);
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.signals.lock().clone()
    }

    pub fn signals_to(&self, pid: u32) -> Vec<Signal> {
        self.signals
            .lock()
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, s)| *s)
            .collect()
    }

    fn signal(&self, pid: u32, signal: Signal) -> VeilResult<()> {
        if self.gone.lock().contains(&pid) {
            return Err(VeilError::ProcessGone { pid });
        }
        self.signals.lock().push((pid, signal));
        Ok(())
    }
}

fn step<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl ProcessControl for FakeProcesses {
    fn read_namespace(&self, pid: u32) -> VeilResult<NamespaceFingerprint> {
        let mut namespaces = self.namespaces.lock();
        namespaces
            .get_mut(&pid)
            .and_then(step)
            .flatten()
            .map(NamespaceFingerprint::new)
            .ok_or(VeilError::NamespaceUnsupported { pid })
    }

    fn find_by_name(&self, name: &str) -> VeilResult<Vec<u32>> {
        let mut names = self.names.lock();
        Ok(names.get_mut(name).and_then(step).unwrap_or_default())
    }

    fn suspend(&self, pid: u32) -> VeilResult<()> {
        self.signal(pid, Signal::Stop)
    }

    fn resume(&self, pid: u32) -> VeilResult<()> {
        self.signal(pid, Signal::Cont)
    }
}

/// What [`FakeLauncher`] does with a request.
#[derive(Debug, Clone)]
pub enum LaunchBehavior {
    /// Resume the target and report success with the given cache state.
    Report(CacheBlock),
    /// Fail without touching the target.
    Fail,
}

/// Worker launcher that acts on [`FakeProcesses`] in-process.
pub struct FakeLauncher {
    processes: Arc<FakeProcesses>,
    behavior: LaunchBehavior,
    gate: Option<Arc<Semaphore>>,
    requests: Mutex<Vec<WorkerRequest>>,
}

impl FakeLauncher {
    pub fn new(processes: Arc<FakeProcesses>, behavior: LaunchBehavior) -> Arc<Self> {
        Arc::new(Self {
            processes,
            behavior,
            gate: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Workers block until a permit is added to the returned semaphore.
    pub fn gated(
        processes: Arc<FakeProcesses>,
        behavior: LaunchBehavior,
    ) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let launcher = Arc::new(Self {
            processes,
            behavior,
            gate: Some(Arc::clone(&gate)),
            requests: Mutex::new(Vec::new()),
        });
        (launcher, gate)
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn run(&self, request: WorkerRequest) -> VeilResult<WorkerReport> {
        self.requests.lock().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let pid = request.target_pid;
        match &self.behavior {
            LaunchBehavior::Report(cache) => {
                let mut report = WorkerReport::new(pid, cache.clone());
                report.joined = true;
                report.resumed = self.processes.resume(pid).is_ok();
                Ok(report)
            }
            LaunchBehavior::Fail => Err(VeilError::Worker {
                pid,
                message: "spawn refused".to_string(),
            }),
        }
    }
}

/// Footprint toggle counting calls and the threads they ran on.
#[derive(Default)]
pub struct RecordingFootprint {
    pub hides: AtomicUsize,
    pub restores: AtomicUsize,
    threads: Mutex<Vec<ThreadId>>,
}

impl RecordingFootprint {
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    pub fn hides(&self) -> usize {
        self.hides.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

impl FootprintToggle for RecordingFootprint {
    fn hide(&self) -> VeilResult<()> {
        self.threads.lock().push(std::thread::current().id());
        self.hides.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self) -> VeilResult<()> {
        self.threads.lock().push(std::thread::current().id());
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Test pacing: no delays, short attempt bounds.
pub fn pacing() -> Pacing {
    Pacing {
        spawner_attempts: 8,
        confirm_attempts: 8,
        drain_timeout_ms: 2_000,
        ..Pacing::immediate()
    }
}

pub fn config(hidden: &[&str]) -> HideConfig {
    hidden
        .iter()
        .fold(HideConfig::default().with_pacing(pacing()), |config, name| {
            config.with_hidden(*name)
        })
}

pub fn monitor(
    config: HideConfig,
    processes: &Arc<FakeProcesses>,
    launcher: &Arc<FakeLauncher>,
    footprint: &Arc<RecordingFootprint>,
) -> Monitor {
    Monitor::new(
        config,
        Arc::clone(processes) as Arc<dyn ProcessControl>,
        Arc::clone(launcher) as Arc<dyn WorkerLauncher>,
        Arc::clone(footprint) as Arc<dyn FootprintToggle>,
    )
}

pub fn notification(pid: u32, name: &str) -> ProcessNotification {
    ProcessNotification {
        pid,
        process_name: name.to_string(),
    }
}
