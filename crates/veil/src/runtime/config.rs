//! Monitor configuration.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use veil_common::{VeilPaths, VeilResult, paths::PROC_ROOT};

use super::events::EventSource;
use crate::filesystem::{Footprint, UnmountPolicy};

/// Delays and retry bounds of every polling loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pacing {
    /// Interval between scans for the primary spawner (milliseconds).
    pub discovery_interval_ms: u64,
    /// Delay between namespace reads of a spawner that has not unshared yet
    /// (microseconds).
    pub spawner_poll_us: u64,
    /// Namespace reads per spawner before giving up for this round.
    pub spawner_attempts: u32,
    /// Delay between namespace reads of a candidate (microseconds).
    pub confirm_poll_us: u64,
    /// Namespace reads per candidate before abandoning it.
    pub confirm_attempts: u32,
    /// How long a worker keeps the footprint hidden after resuming its
    /// target (milliseconds).
    pub settle_ms: u64,
    /// How long shutdown waits for in-flight workers (milliseconds).
    pub drain_timeout_ms: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 2_000,
            spawner_poll_us: 500,
            spawner_attempts: 20_000,
            confirm_poll_us: 50,
            confirm_attempts: 20_000,
            settle_ms: 10_000,
            drain_timeout_ms: 15_000,
        }
    }
}

impl Pacing {
    /// Pacing with every delay set to zero, for tests and simulations.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            discovery_interval_ms: 0,
            spawner_poll_us: 0,
            confirm_poll_us: 0,
            settle_ms: 0,
            drain_timeout_ms: 1_000,
            ..Self::default()
        }
    }

    /// Interval between spawner scans.
    #[must_use]
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// Delay between spawner namespace reads.
    #[must_use]
    pub fn spawner_poll(&self) -> Duration {
        Duration::from_micros(self.spawner_poll_us)
    }

    /// Delay between candidate namespace reads.
    #[must_use]
    pub fn confirm_poll(&self) -> Duration {
        Duration::from_micros(self.confirm_poll_us)
    }

    /// Worker settle delay.
    #[must_use]
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Shutdown drain timeout.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Shortest delay the tokio timer can honour; it ticks once per millisecond.
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// Sleep for `duration`, or just yield when it is zero.
///
/// Delays below the timer resolution are spun out against the clock,
/// yielding between checks, so microsecond polls stay microsecond polls.
pub(crate) async fn pause(duration: Duration) {
    if duration.is_zero() {
        tokio::task::yield_now().await;
    } else if duration < TIMER_RESOLUTION {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            std::hint::spin_loop();
            tokio::task::yield_now().await;
        }
    } else {
        tokio::time::sleep(duration).await;
    }
}

/// Monitor configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HideConfig {
    /// procfs root.
    pub proc_root: PathBuf,
    /// Spawner process names; the first one is mandatory.
    pub spawners: Vec<String>,
    /// Process names hidden from the start.
    pub hide: Vec<String>,
    /// Where process-start notifications come from.
    pub events: EventSource,
    /// Capacity of the notification channel.
    pub channel_capacity: usize,
    /// Polling delays and bounds.
    pub pacing: Pacing,
    /// Which mounts a worker removes.
    pub unmount: UnmountPolicy,
    /// Marker files hidden while workers run.
    pub footprint: Footprint,
}

impl Default for HideConfig {
    fn default() -> Self {
        Self {
            proc_root: PROC_ROOT.clone(),
            spawners: vec!["zygote".to_string(), "zygote64".to_string()],
            hide: Vec::new(),
            events: EventSource::default(),
            channel_capacity: 64,
            pacing: Pacing::default(),
            unmount: UnmountPolicy::default(),
            footprint: Footprint::default(),
        }
    }
}

impl HideConfig {
    /// Load a configuration file; missing keys keep their defaults.
    pub fn load(path: &Path) -> VeilResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;

        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// procfs paths for this configuration.
    #[must_use]
    pub fn paths(&self) -> VeilPaths {
        VeilPaths::with_proc_root(&self.proc_root)
    }

    /// Set the procfs root.
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Add a process name to the initial hide list.
    #[must_use]
    pub fn with_hidden(mut self, name: impl Into<String>) -> Self {
        self.hide.push(name.into());
        self
    }

    /// Set the notification source.
    #[must_use]
    pub fn with_events(mut self, events: EventSource) -> Self {
        self.events = events;
        self
    }

    /// Set the polling delays.
    #[must_use]
    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Set the marker footprint.
    #[must_use]
    pub fn with_footprint(mut self, footprint: Footprint) -> Self {
        self.footprint = footprint;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = HideConfig::default();
        assert_eq!(config.spawners, vec!["zygote", "zygote64"]);
        assert!(config.hide.is_empty());
        assert_eq!(config.pacing.settle(), Duration::from_secs(10));
        assert_eq!(config.pacing.confirm_poll(), Duration::from_micros(50));
    }

    #[test]
    fn builder_pattern() {
        let config = HideConfig::default()
            .with_proc_root("/tmp/proc")
            .with_hidden("com.example.bank")
            .with_events(EventSource::Stdin)
            .with_pacing(Pacing::immediate());

        assert_eq!(config.paths().mount_namespace(1), PathBuf::from("/tmp/proc/1/ns/mnt"));
        assert_eq!(config.hide, vec!["com.example.bank"]);
        assert_eq!(config.events, EventSource::Stdin);
        assert!(config.pacing.settle().is_zero());
    }

    #[tokio::test]
    async fn sub_millisecond_pauses_are_not_rounded_up() {
        let started = Instant::now();
        for _ in 0..100 {
            pause(Duration::from_micros(50)).await;
        }
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(5));
        // A timer-backed sleep would take at least 100 ms here
        assert!(elapsed < Duration::from_millis(60), "took {elapsed:?}");
    }

    #[test]
    fn load_partial_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("veil.toml");
        std::fs::write(
            &path,
            r#"
            hide = ["com.example.bank", "com.example.game"]

            [pacing]
            settle_ms = 2500

            [events]
            kind = "file"
            path = "/dev/socket/events"
            "#,
        )
        .unwrap();

        let config = HideConfig::load(&path).unwrap();
        assert_eq!(config.hide.len(), 2);
        assert_eq!(config.pacing.settle_ms, 2500);
        assert_eq!(config.pacing.confirm_poll_us, 50);
        assert_eq!(
            config.events,
            EventSource::File {
                path: PathBuf::from("/dev/socket/events")
            }
        );
        assert_eq!(config.spawners.len(), 2);
    }

    #[test]
    fn load_rejects_bad_toml() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("veil.toml");
        std::fs::write(&path, "hide = 42").unwrap();

        let err = HideConfig::load(&path).unwrap_err();
        assert!(matches!(err, veil_common::VeilError::Config { .. }));
    }
}
