//! # Veil
//!
//! Veil hides a root overlay from selected applications. It watches process
//! start notifications, freezes every process whose name is on the hide list
//! as soon as it has its own mount namespace, and hands it to a short-lived
//! worker that detaches the overlay mounts inside that namespace before
//! letting the process run.
//!
//! ## Features
//!
//! - **Namespace gating**: a process is only frozen once its mount namespace
//!   has split from the spawner's, so unmounts never leak into other apps
//! - **Single-threaded workers**: each target gets its own worker process,
//!   as `setns` requires
//! - **Footprint toggling**: marker files are hidden while any worker runs
//!
//! ## Usage
//!
//! ```no_run
//! use veil::runtime::{Cancellation, EventListener, HideConfig, LineSource, Monitor};
//!
//! # async fn example() -> veil_common::VeilResult<()> {
//! let config = HideConfig::default().with_hidden("com.example.bank");
//! let monitor = Monitor::for_host(config.clone())?;
//! let cancel = Cancellation::new();
//!
//! let (listener, mut notifications) = EventListener::channel(config.channel_capacity);
//! tokio::spawn(listener.run(LineSource::open(&config.events).await?));
//!
//! monitor.run(&mut notifications, &cancel).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod exec;
pub mod filesystem;
pub mod namespace;
pub mod runtime;

pub use runtime::{HideConfig, Monitor};
