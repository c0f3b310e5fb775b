//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};

use crate::exec;
use crate::runtime::{Cancellation, EventSource, HideConfig, Monitor};

/// Veil - hide a root overlay from selected apps
#[derive(Parser)]
#[command(name = "veil")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Helper commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Watch process starts and hide the overlay from listed apps
    Monitor {
        /// Process name to hide from (repeatable)
        #[arg(long = "hide", value_name = "NAME")]
        hide: Vec<String>,

        /// Configuration file (TOML)
        #[arg(short, long, env = "VEIL_CONFIG")]
        config: Option<PathBuf>,

        /// Notification source: `logcat`, `-` for stdin, or a file path
        #[arg(short, long, value_name = "SRC")]
        events: Option<EventSource>,

        /// procfs root
        #[arg(long, value_name = "DIR")]
        proc_root: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Configuration file (TOML)
        #[arg(short, long, env = "VEIL_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Run one hide worker (request on stdin, report on stdout)
    #[command(hide = true)]
    Worker,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// Workers run on the calling thread with no async runtime; joining a
    /// mount namespace requires a single-threaded process.
    pub fn execute(self) -> Result<()> {
        match self.command {
            Commands::Monitor {
                hide,
                config,
                events,
                proc_root,
            } => {
                let mut config = load_config(config.as_deref())?;
                for name in hide {
                    config = config.with_hidden(name);
                }
                if let Some(events) = events {
                    config = config.with_events(events);
                }
                if let Some(root) = proc_root {
                    config = config.with_proc_root(root);
                }

                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(run_monitor(config))
            }

            Commands::Config { config } => {
                let config = load_config(config.as_deref())?;
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }

            Commands::Worker => {
                exec::serve_stdio().map_err(|e| eyre!("Worker failed: {}", e))?;
                Ok(())
            }
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<HideConfig> {
    match path {
        Some(path) => HideConfig::load(path)
            .map_err(|e| eyre!("Failed to load {}: {}", path.display(), e)),
        None => Ok(HideConfig::default()),
    }
}

async fn run_monitor(config: HideConfig) -> Result<()> {
    if config.hide.is_empty() {
        tracing::warn!("Hide list is empty, nothing will be hidden");
    }

    let monitor = Monitor::for_host(config)?;
    let cancel = Cancellation::new();

    let signals = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested");
        signals.cancel();
    });

    let Some(spawners) = monitor
        .discover(&cancel)
        .await
        .map_err(|e| eyre!("Spawner discovery failed: {}", e))?
    else {
        return Ok(());
    };

    monitor
        .serve_events(&spawners, &cancel)
        .await
        .map_err(|e| eyre!("Event source failed: {}", e))
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot watch SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
