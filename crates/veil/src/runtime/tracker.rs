//! In-flight worker accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::filesystem::FootprintToggle;

/// Counts dispatched workers and restores the footprint when the last one
/// completes.
///
/// Only the completion that moves the counter from one to zero performs the
/// restore, so there is exactly one restore per drained window. Clones share
/// the same counter.
#[derive(Clone)]
pub struct CompletionTracker {
    in_flight: Arc<AtomicUsize>,
    // in-flight plus completions still restoring
    unsettled: Arc<AtomicUsize>,
    restores: Arc<AtomicU64>,
    idle: Arc<Notify>,
    footprint: Arc<dyn FootprintToggle>,
}

impl std::fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("in_flight", &self.in_flight())
            .field("restores", &self.restores())
            .finish_non_exhaustive()
    }
}

impl CompletionTracker {
    /// Create a tracker restoring `footprint`.
    pub fn new(footprint: Arc<dyn FootprintToggle>) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            unsettled: Arc::new(AtomicUsize::new(0)),
            restores: Arc::new(AtomicU64::new(0)),
            idle: Arc::new(Notify::new()),
            footprint,
        }
    }

    /// Record a dispatched worker. Returns the new in-flight count.
    pub fn begin(&self) -> usize {
        self.unsettled.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record a finished worker.
    ///
    /// Returns `true` when this completion drained the counter and restored
    /// the footprint. A completion without a matching [`Self::begin`] is
    /// ignored rather than wrapping the counter.
    ///
    /// Restoring remounts the root, so async callers run this through
    /// `spawn_blocking`.
    pub fn complete(&self) -> bool {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        let drained = match previous {
            Ok(1) => {
                self.restore();
                true
            }
            Ok(remaining) => {
                tracing::trace!(in_flight = remaining - 1, "Worker completed");
                false
            }
            Err(_) => {
                tracing::warn!("Completion reported with no worker in flight");
                return false;
            }
        };

        if self.unsettled.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
        drained
    }

    /// Restore the footprint regardless of the counter.
    ///
    /// Used at shutdown when workers outlive the drain timeout.
    pub fn force_restore(&self) {
        self.restore();
    }

    fn restore(&self) {
        match self.footprint.restore() {
            Ok(()) => tracing::debug!("Footprint restored, no worker in flight"),
            Err(e) => tracing::warn!(error = %e, "Failed to restore footprint"),
        }
        self.restores.fetch_add(1, Ordering::SeqCst);
    }

    /// Workers dispatched but not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// How many restores have run.
    #[must_use]
    pub fn restores(&self) -> u64 {
        self.restores.load(Ordering::SeqCst)
    }

    /// Wait until no worker is in flight and the last restore has run.
    /// Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.unsettled.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}
