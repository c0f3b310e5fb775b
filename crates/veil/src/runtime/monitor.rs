//! The monitor loop.
//!
//! Each notification walks `received → name matched → namespace confirmed →
//! frozen → dispatched`, dropping out at the first step that does not hold.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, watch};
use veil_common::VeilResult;

use super::config::{HideConfig, pause};
use super::events::{EventListener, LineSource, ProcessNotification};
use super::registry::HideRegistry;
use super::tracker::CompletionTracker;
use crate::exec::{
    CacheBlock, HostProcesses, ProcessControl, ProcessLauncher, WorkerLauncher, WorkerRequest,
};
use crate::filesystem::{FootprintToggle, MarkerFootprint};
use crate::namespace::{NamespaceFingerprint, SpawnerSet, locate_spawners};

/// Handle that stops a running monitor.
///
/// Cloning yields handles to the same switch; cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct Cancellation {
    switch: Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    /// Create an untriggered handle.
    #[must_use]
    pub fn new() -> Self {
        let (switch, _) = watch::channel(false);
        Self {
            switch: Arc::new(switch),
        }
    }

    /// Request the monitor to stop.
    pub fn cancel(&self) {
        self.switch.send_replace(true);
    }

    /// Whether [`Self::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.switch.borrow()
    }

    /// Resolve once cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.switch.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// How the monitor handled one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Name not hidden, or the monitor is disabled.
    Ignored,
    /// The process never left the spawner namespace.
    Unconfirmed,
    /// The process went away before it could be frozen.
    Exited,
    /// Frozen and handed to a worker.
    Dispatched,
}

/// Cache device shared by every worker, learnt from the first report that
/// carries it.
#[derive(Debug, Clone, Default)]
pub struct BlockIdentityCache {
    block: Arc<OnceCell<CacheBlock>>,
}

impl BlockIdentityCache {
    /// The cache state to hand to the next worker.
    #[must_use]
    pub fn current(&self) -> CacheBlock {
        self.block.get().cloned().unwrap_or_default()
    }

    /// Remember a discovered state. The first known state wins.
    pub fn record(&self, block: &CacheBlock) {
        if block.is_known() && self.block.set(block.clone()).is_ok() {
            tracing::debug!(cache = ?block, "Recorded cache block");
        }
    }
}

/// Freezes hidden processes at startup and dispatches hide workers.
pub struct Monitor {
    config: HideConfig,
    registry: HideRegistry,
    control: Arc<dyn ProcessControl>,
    launcher: Arc<dyn WorkerLauncher>,
    footprint: Arc<dyn FootprintToggle>,
    tracker: CompletionTracker,
    cache: BlockIdentityCache,
    enabled: AtomicBool,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("registry", &self.registry)
            .field("tracker", &self.tracker)
            .field("cache", &self.cache.current())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Create a monitor over the given collaborators. The hide registry is
    /// seeded from `config.hide`.
    pub fn new(
        config: HideConfig,
        control: Arc<dyn ProcessControl>,
        launcher: Arc<dyn WorkerLauncher>,
        footprint: Arc<dyn FootprintToggle>,
    ) -> Self {
        let registry = HideRegistry::with_names(config.hide.iter().cloned());
        let tracker = CompletionTracker::new(Arc::clone(&footprint));

        Self {
            config,
            registry,
            control,
            launcher,
            footprint,
            tracker,
            cache: BlockIdentityCache::default(),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a monitor acting on the host: procfs, real signals, workers
    /// re-executed from the current binary and the configured markers.
    pub fn for_host(config: HideConfig) -> VeilResult<Self> {
        let control = HostProcesses::new(config.paths());
        let launcher = ProcessLauncher::current_exe()?.with_proc_root(&config.proc_root);
        let footprint = MarkerFootprint::new(config.footprint.clone());

        Ok(Self::new(
            config,
            Arc::new(control),
            Arc::new(launcher),
            Arc::new(footprint),
        ))
    }

    /// The hide list. Clones share entries with the monitor.
    #[must_use]
    pub fn registry(&self) -> &HideRegistry {
        &self.registry
    }

    /// In-flight worker accounting.
    #[must_use]
    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    /// Cache device learnt from workers.
    #[must_use]
    pub fn cache(&self) -> &BlockIdentityCache {
        &self.cache
    }

    /// Whether the monitor still acts on notifications.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Locate the spawner namespaces. Returns `None` when cancelled first.
    pub async fn discover(&self, cancel: &Cancellation) -> VeilResult<Option<SpawnerSet>> {
        let pacing = &self.config.pacing;
        let located = locate_spawners(self.control.as_ref(), &self.config.spawners, pacing);

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!("Cancelled during spawner discovery");
                Ok(None)
            }
            spawners = located => spawners.map(Some),
        }
    }

    /// Discover the spawners, then [`Self::serve`] until cancelled.
    ///
    /// Fails only when mount namespaces are unsupported.
    pub async fn run(
        &self,
        notifications: &mut mpsc::Receiver<ProcessNotification>,
        cancel: &Cancellation,
    ) -> VeilResult<()> {
        match self.discover(cancel).await? {
            Some(spawners) => self.serve(&spawners, notifications, cancel).await,
            None => self.terminate(notifications).await,
        }
        Ok(())
    }

    /// Handle notifications until cancelled or the channel closes, then
    /// tear down.
    pub async fn serve(
        &self,
        spawners: &SpawnerSet,
        notifications: &mut mpsc::Receiver<ProcessNotification>,
        cancel: &Cancellation,
    ) {
        tracing::info!(
            hidden = self.registry.len(),
            spawners = spawners.len(),
            "Monitor started"
        );

        loop {
            let notification = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = notifications.recv() => match received {
                    Some(notification) => notification,
                    None => {
                        tracing::info!("Notification channel closed");
                        break;
                    }
                },
            };

            // Only the namespace poll awaits, so cancelling never strands a
            // frozen target.
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                outcome = self.process_notification(spawners, &notification) => outcome,
            };
            tracing::trace!(pid = notification.pid, ?outcome, "Notification handled");
        }

        self.terminate(notifications).await;
    }

    /// Open the configured event source and [`serve`](Self::serve) its
    /// notifications.
    ///
    /// If the source cannot be opened the monitor is torn down before the
    /// error is returned.
    pub async fn serve_events(
        &self,
        spawners: &SpawnerSet,
        cancel: &Cancellation,
    ) -> VeilResult<()> {
        let (listener, mut notifications) = EventListener::channel(self.config.channel_capacity);
        let source = match LineSource::open(&self.config.events).await {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(error = %e, "Cannot open event source");
                self.terminate(&mut notifications).await;
                return Err(e);
            }
        };

        let listening = tokio::spawn(async move {
            match listener.run(source).await {
                Ok(delivered) => tracing::debug!(delivered, "Listener finished"),
                Err(e) => tracing::error!(error = %e, "Listener failed"),
            }
        });

        self.serve(spawners, &mut notifications, cancel).await;
        listening.abort();
        Ok(())
    }

    /// Run one notification through the state machine.
    pub async fn process_notification(
        &self,
        spawners: &SpawnerSet,
        notification: &ProcessNotification,
    ) -> Outcome {
        let pid = notification.pid;
        if !self.is_enabled() || !self.registry.matches(&notification.process_name) {
            return Outcome::Ignored;
        }
        tracing::debug!(pid, name = %notification.process_name, "Hidden process started");

        let ns = match self.confirm_namespace(spawners, pid).await {
            Ok(ns) => ns,
            Err(outcome) => return outcome,
        };

        if let Err(e) = self.control.suspend(pid) {
            tracing::debug!(pid, error = %e, "Process exited before it could be frozen");
            return Outcome::Exited;
        }
        tracing::info!(pid, name = %notification.process_name, ns = %ns, "Process frozen");

        let in_flight = self.tracker.begin();
        tracing::debug!(pid, in_flight, "Dispatching worker");

        self.dispatch(pid);
        Outcome::Dispatched
    }

    /// Poll until `pid` has its own namespace, distinct from every spawner.
    async fn confirm_namespace(
        &self,
        spawners: &SpawnerSet,
        pid: u32,
    ) -> Result<NamespaceFingerprint, Outcome> {
        let pacing = &self.config.pacing;

        for _ in 0..pacing.confirm_attempts.max(1) {
            match self.control.read_namespace(pid) {
                Ok(ns) if !spawners.contains(&ns) => return Ok(ns),
                Ok(_) => pause(pacing.confirm_poll()).await,
                Err(e) => {
                    tracing::debug!(pid, error = %e, "Lost process while confirming namespace");
                    return Err(Outcome::Exited);
                }
            }
        }

        tracing::debug!(
            pid,
            attempts = pacing.confirm_attempts,
            "Process never left the spawner namespace"
        );
        Err(Outcome::Unconfirmed)
    }

    fn dispatch(&self, pid: u32) {
        let request = WorkerRequest {
            target_pid: pid,
            cache: self.cache.current(),
            policy: self.config.unmount.clone(),
            settle_ms: self.config.pacing.settle_ms,
        };
        let launcher = Arc::clone(&self.launcher);
        let control = Arc::clone(&self.control);
        let tracker = self.tracker.clone();
        let cache = self.cache.clone();
        let footprint = Arc::clone(&self.footprint);

        tokio::spawn(async move {
            // Marker edits remount the root; keep them off the runtime threads.
            match tokio::task::spawn_blocking(move || footprint.hide()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to hide footprint"),
                Err(e) => tracing::warn!(error = %e, "Footprint task failed"),
            }

            let resumed = match launcher.run(request).await {
                Ok(report) => {
                    cache.record(&report.cache);
                    tracing::debug!(
                        pid,
                        unmounted = report.unmounted.len(),
                        failed = report.failed.len(),
                        "Worker finished"
                    );
                    report.resumed
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Worker failed");
                    false
                }
            };

            if !resumed {
                match control.resume(pid) {
                    Ok(()) => tracing::info!(pid, "Resumed target after worker failure"),
                    Err(e) => tracing::warn!(pid, error = %e, "Failed to resume target"),
                }
            }
            if let Err(e) = tokio::task::spawn_blocking(move || tracker.complete()).await {
                tracing::warn!(pid, error = %e, "Completion task failed");
            }
        });
    }

    /// Release the registry, disable the monitor and close the channel.
    ///
    /// Suspended targets are left to their workers. Shutdown waits for
    /// in-flight workers up to the drain timeout and restores the footprint
    /// itself if they outlive it.
    async fn terminate(&self, notifications: &mut mpsc::Receiver<ProcessNotification>) {
        let released = self.registry.clear();
        self.enabled.store(false, Ordering::SeqCst);

        notifications.close();
        let mut discarded = 0usize;
        while notifications.try_recv().is_ok() {
            discarded += 1;
        }
        tracing::info!(released, discarded, "Monitor stopped");

        let in_flight = self.tracker.in_flight();
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for workers");
        }
        if !self.tracker.wait_idle(self.config.pacing.drain_timeout()).await {
            tracing::warn!(
                in_flight = self.tracker.in_flight(),
                "Workers still running after drain timeout, restoring footprint"
            );
            let tracker = self.tracker.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || tracker.force_restore()).await {
                tracing::warn!(error = %e, "Forced restore failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_wakes_waiters() {
        let cancel = Cancellation::new();
        assert!(!cancel.is_cancelled());

        let waiter = cancel.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        cancel.cancel();
        handle.await.unwrap();
        assert!(cancel.is_cancelled());

        // Already cancelled resolves immediately
        cancel.cancelled().await;
    }

    #[test]
    fn block_cache_keeps_first_known_state() {
        let cache = BlockIdentityCache::default();
        assert_eq!(cache.current(), CacheBlock::Unknown);

        cache.record(&CacheBlock::Unknown);
        assert_eq!(cache.current(), CacheBlock::Unknown);

        cache.record(&CacheBlock::Device("/dev/block/sda5".to_string()));
        cache.record(&CacheBlock::Absent);
        assert_eq!(
            cache.current(),
            CacheBlock::Device("/dev/block/sda5".to_string())
        );
    }
}
