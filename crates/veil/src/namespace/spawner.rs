//! Spawner namespace discovery.
//!
//! Application processes are forked by one spawner per architecture (zygote,
//! zygote64). Each spawner unshares its own mount namespace shortly after it
//! starts, so a freshly started spawner may still report the init namespace.
//! Discovery waits that out and records the namespaces the spawners settle
//! in.

use veil_common::{VeilError, VeilResult};

use super::NamespaceFingerprint;
use crate::exec::ProcessControl;
use crate::runtime::{Pacing, pause};

/// Namespaces of the running spawners, written once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnerSet {
    fingerprints: Vec<NamespaceFingerprint>,
}

impl SpawnerSet {
    /// At most one spawner per supported architecture.
    pub const CAPACITY: usize = 2;

    /// Build a set from already known fingerprints, keeping the first
    /// [`Self::CAPACITY`] distinct ones.
    #[must_use]
    pub fn from_fingerprints(fingerprints: impl IntoIterator<Item = NamespaceFingerprint>) -> Self {
        let mut set = Self::default();
        for fingerprint in fingerprints {
            set.insert(fingerprint);
        }
        set
    }

    fn insert(&mut self, fingerprint: NamespaceFingerprint) -> bool {
        if self.is_full() || self.contains(&fingerprint) {
            return false;
        }
        self.fingerprints.push(fingerprint);
        true
    }

    /// Whether `fingerprint` belongs to a spawner.
    #[must_use]
    pub fn contains(&self, fingerprint: &NamespaceFingerprint) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    /// Number of recorded spawners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    /// Whether no spawner was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Whether no further spawner can be recorded.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.fingerprints.len() >= Self::CAPACITY
    }

    /// Recorded fingerprints in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &NamespaceFingerprint> {
        self.fingerprints.iter()
    }
}

/// Discover the spawner namespaces.
///
/// `names[0]` is the primary spawner and is waited for indefinitely, checking
/// every [`Pacing::discovery_interval`]; the remaining names are optional and
/// looked up once. Fails only when the init namespace cannot be read, which
/// means the kernel has no mount namespace support.
pub async fn locate_spawners<C>(
    control: &C,
    names: &[String],
    pacing: &Pacing,
) -> VeilResult<SpawnerSet>
where
    C: ProcessControl + ?Sized,
{
    let bootstrap = control.read_namespace(1)?;
    tracing::info!(ns = %bootstrap, "Init mount namespace");

    let (primary, secondary) = names.split_first().ok_or_else(|| VeilError::Config {
        message: "at least one spawner process name is required".to_string(),
    })?;

    let mut set = SpawnerSet::default();
    loop {
        record_spawner(control, primary, &bootstrap, pacing, &mut set).await;
        if !set.is_empty() {
            break;
        }
        tracing::debug!(name = %primary, "Spawner not running yet");
        pause(pacing.discovery_interval()).await;
    }

    for name in secondary {
        record_spawner(control, name, &bootstrap, pacing, &mut set).await;
    }

    for ns in set.iter() {
        tracing::info!(ns = %ns, "Spawner mount namespace");
    }
    Ok(set)
}

/// Record the namespace of every running process called `name`.
async fn record_spawner<C>(
    control: &C,
    name: &str,
    bootstrap: &NamespaceFingerprint,
    pacing: &Pacing,
    set: &mut SpawnerSet,
) where
    C: ProcessControl + ?Sized,
{
    let pids = match control.find_by_name(name) {
        Ok(pids) => pids,
        Err(e) => {
            tracing::warn!(name, error = %e, "Cannot list processes");
            return;
        }
    };

    for pid in pids {
        if set.is_full() {
            return;
        }
        if let Some(ns) = wait_for_unshare(control, pid, bootstrap, pacing).await {
            set.insert(ns);
        }
    }
}

/// Poll `pid` until its namespace differs from the init namespace.
async fn wait_for_unshare<C>(
    control: &C,
    pid: u32,
    bootstrap: &NamespaceFingerprint,
    pacing: &Pacing,
) -> Option<NamespaceFingerprint>
where
    C: ProcessControl + ?Sized,
{
    for _ in 0..pacing.spawner_attempts.max(1) {
        pause(pacing.spawner_poll()).await;
        match control.read_namespace(pid) {
            Ok(ns) if ns != *bootstrap => return Some(ns),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(pid, error = %e, "Spawner vanished during discovery");
                return None;
            }
        }
    }

    tracing::warn!(
        pid,
        attempts = pacing.spawner_attempts,
        "Spawner never left the init namespace"
    );
    None
}
