//! Process-start notifications and the listener feeding them to the monitor.

use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use veil_common::{VeilError, VeilResult};

/// Longest process name a notification may carry, in bytes.
pub const MAX_PROCESS_NAME: usize = 256;

/// A process that just started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNotification {
    /// Process id of the new process.
    pub pid: u32,
    /// Its process name.
    pub process_name: String,
}

/// Field layouts of a process-start record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordLayout {
    /// `[timestamp, uid, pid, seq, ppid, x, name]`
    Extended,
    /// `[timestamp, uid, pid, ppid, name]` or `[timestamp, uid, pid, seq, ppid, name]`
    Compact,
}

impl RecordLayout {
    const ALL: [Self; 2] = [Self::Extended, Self::Compact];
    const PID_FIELD: usize = 2;

    fn fits(self, fields: usize) -> bool {
        match self {
            Self::Extended => fields == 7,
            Self::Compact => fields == 5 || fields == 6,
        }
    }

    fn extract(self, fields: &[&str]) -> Option<ProcessNotification> {
        if !self.fits(fields.len()) {
            return None;
        }

        let (name, numeric) = fields.split_last()?;
        if numeric.iter().any(|field| field.parse::<i64>().is_err()) {
            return None;
        }

        let pid = numeric[Self::PID_FIELD].parse::<u32>().ok().filter(|pid| *pid > 0)?;
        if name.is_empty() || name.len() > MAX_PROCESS_NAME {
            return None;
        }

        Some(ProcessNotification {
            pid,
            process_name: (*name).to_string(),
        })
    }
}

impl ProcessNotification {
    /// Parse a raw notification line.
    ///
    /// The record is the bracketed, comma-separated field list somewhere in
    /// the line; anything before `[` or after `]` is ignored. Lines that fit
    /// neither layout are rejected.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let start = line.find('[')?;
        let body = &line[start + 1..];
        let body = body.split(']').next().unwrap_or(body);
        let normalized = body.replace(',', " ");
        let fields: Vec<&str> = normalized.split_whitespace().collect();

        RecordLayout::ALL
            .iter()
            .find_map(|layout| layout.extract(&fields))
    }
}

/// Where raw notification lines come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSource {
    /// Stdout of a long-running command.
    Command {
        /// Program to run.
        program: String,
        /// Its arguments.
        #[serde(default)]
        args: Vec<String>,
    },
    /// A file or FIFO.
    File {
        /// Path to read.
        path: PathBuf,
    },
    /// Our own stdin.
    Stdin,
}

impl Default for EventSource {
    fn default() -> Self {
        Self::Command {
            program: "logcat".to_string(),
            args: ["-b", "events", "-v", "raw", "-s", "am_proc_start"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl FromStr for EventSource {
    type Err = VeilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(VeilError::Config {
                message: "empty event source".to_string(),
            }),
            "-" => Ok(Self::Stdin),
            "logcat" => Ok(Self::default()),
            path => Ok(Self::File {
                path: PathBuf::from(path),
            }),
        }
    }
}

/// An open line stream.
///
/// For command sources the child is owned here and killed when the source is
/// dropped.
pub struct LineSource {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    child: Option<tokio::process::Child>,
}

impl std::fmt::Debug for LineSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineSource")
            .field("child", &self.child.as_ref().and_then(tokio::process::Child::id))
            .finish_non_exhaustive()
    }
}

impl LineSource {
    /// Open a configured source.
    pub async fn open(source: &EventSource) -> VeilResult<Self> {
        match source {
            EventSource::Command { program, args } => {
                let mut child = tokio::process::Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| VeilError::Config {
                        message: format!("cannot start event source {program}: {e}"),
                    })?;
                let stdout = child.stdout.take().ok_or_else(|| VeilError::Internal {
                    message: "event source stdout not captured".to_string(),
                })?;

                tracing::info!(program = %program, pid = ?child.id(), "Started event source");
                Ok(Self {
                    reader: Box::new(BufReader::new(stdout)),
                    child: Some(child),
                })
            }
            EventSource::File { path } => {
                let file = tokio::fs::File::open(path).await?;
                tracing::info!(path = %path.display(), "Reading events from file");
                Ok(Self::from_reader(BufReader::new(file)))
            }
            EventSource::Stdin => Ok(Self::from_reader(BufReader::new(tokio::io::stdin()))),
        }
    }

    /// Wrap an arbitrary buffered reader.
    pub fn from_reader(reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            child: None,
        }
    }
}

/// Producer side of the notification channel.
///
/// The monitor owns the only receiver; once it closes the channel the
/// listener stops at the next record.
#[derive(Debug)]
pub struct EventListener {
    sender: mpsc::Sender<ProcessNotification>,
}

impl EventListener {
    /// Create a listener and the receiver the monitor consumes.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProcessNotification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Forward every parsable line of `source` until it ends or the monitor
    /// goes away. Returns the number of records delivered.
    pub async fn run(self, mut source: LineSource) -> VeilResult<u64> {
        let mut buf = Vec::new();
        let mut delivered = 0u64;

        loop {
            // An interrupted read keeps what it consumed; the retry appends
            match source.reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    tracing::debug!(delivered, "Event source closed");
                    break;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let parsed = {
                let line = String::from_utf8_lossy(&buf);
                let parsed = ProcessNotification::parse(&line);
                if parsed.is_none() {
                    tracing::trace!(line = %line.trim_end(), "Dropped unparsable record");
                }
                parsed
            };
            buf.clear();
            let Some(notification) = parsed else {
                continue;
            };

            if self.sender.send(notification).await.is_err() {
                tracing::debug!(delivered, "Monitor closed the notification channel");
                break;
            }
            delivered += 1;
        }

        Ok(delivered)
    }
}
