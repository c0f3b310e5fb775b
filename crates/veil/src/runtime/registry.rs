//! The list of process names to hide from.

use std::sync::Arc;

use parking_lot::Mutex;

/// Ordered set of process names, shared between the monitor and whoever
/// edits the list.
///
/// Every operation holds the same mutex, so a lookup never observes a
/// half-applied edit. Clones share the underlying list.
#[derive(Debug, Clone, Default)]
pub struct HideRegistry {
    names: Arc<Mutex<Vec<String>>>,
}

impl HideRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding `names`, duplicates removed.
    #[must_use]
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for name in names {
            registry.add(name);
        }
        registry
    }

    /// Append `name`. Returns `false` if it was already present.
    pub fn add(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        let mut names = self.names.lock();
        if names.contains(&name) {
            return false;
        }
        tracing::debug!(name = %name, "Added to hide list");
        names.push(name);
        true
    }

    /// Remove `name`. Returns `false` if it was not present.
    pub fn remove(&self, name: &str) -> bool {
        let mut names = self.names.lock();
        let before = names.len();
        names.retain(|n| n != name);
        let removed = names.len() != before;
        if removed {
            tracing::debug!(name, "Removed from hide list");
        }
        removed
    }

    /// Exact, case-sensitive membership test.
    #[must_use]
    pub fn matches(&self, process_name: &str) -> bool {
        self.inspect(|names| names.iter().any(|n| n == process_name))
    }

    /// Run `f` over the names with the lock held.
    pub fn inspect<R>(&self, f: impl FnOnce(&[String]) -> R) -> R {
        let names = self.names.lock();
        f(&names)
    }

    /// Copy of the current names in insertion order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inspect(<[String]>::to_vec)
    }

    /// Drop every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut names = self.names.lock();
        let count = names.len();
        names.clear();
        count
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }
}
