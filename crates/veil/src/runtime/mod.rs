//! Monitor runtime.
//!
//! This module provides the monitor loop, its configuration and the shared
//! state it coordinates: the hide list, the notification listener and the
//! in-flight worker tracker.

mod config;
pub mod events;
mod monitor;
mod registry;
mod tracker;

pub use config::{HideConfig, Pacing};
pub(crate) use config::pause;
pub use events::{EventListener, EventSource, LineSource, ProcessNotification};
pub use monitor::{BlockIdentityCache, Cancellation, Monitor, Outcome};
pub use registry::HideRegistry;
pub use tracker::CompletionTracker;
