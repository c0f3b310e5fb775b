//! Common error types for veil.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`VeilError`].
pub type VeilResult<T> = Result<T, VeilError>;

/// Errors shared by the monitor, the worker and the CLI.
#[derive(Error, Diagnostic, Debug)]
pub enum VeilError {
    /// The mount namespace handle of a process cannot be read.
    #[error("Mount namespace not available for pid {pid}")]
    #[diagnostic(
        code(veil::namespace::unsupported),
        help("The kernel must be built with CONFIG_NAMESPACES and /proc must be mounted")
    )]
    NamespaceUnsupported {
        /// The process whose namespace was queried.
        pid: u32,
    },

    /// The process exited before an operation could reach it.
    #[error("Process {pid} is gone")]
    #[diagnostic(code(veil::process::gone))]
    ProcessGone {
        /// The vanished process.
        pid: u32,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(veil::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(veil::serialization))]
    Serialization(String),

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(veil::permission_denied),
        help("The monitor needs root and CAP_SYS_ADMIN to join namespaces and unmount")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(veil::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// A hide worker could not be launched or misbehaved.
    #[error("Worker for pid {pid} failed: {message}")]
    #[diagnostic(code(veil::worker))]
    Worker {
        /// The target the worker was bound to.
        pid: u32,
        /// What went wrong.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(veil::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl VeilError {
    /// Map an I/O error on a process-scoped operation, folding `ESRCH` and
    /// `ENOENT` into [`VeilError::ProcessGone`].
    #[must_use]
    pub fn from_process_io(pid: u32, err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ESRCH) | Some(libc::ENOENT) => Self::ProcessGone { pid },
            Some(libc::EPERM) | Some(libc::EACCES) => Self::PermissionDenied {
                operation: format!("access process {pid}: {err}"),
            },
            _ => Self::Io(err),
        }
    }
}

impl From<serde_json::Error> for VeilError {
    fn from(err: serde_json::Error) -> Self {
        VeilError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for VeilError {
    fn from(err: toml::de::Error) -> Self {
        VeilError::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = VeilError::NamespaceUnsupported { pid: 1 };
        assert_eq!(err.to_string(), "Mount namespace not available for pid 1");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VeilError = io_err.into();
        assert!(matches!(err, VeilError::Io(_)));
    }

    #[test]
    fn process_io_folds_esrch() {
        let err = VeilError::from_process_io(42, std::io::Error::from_raw_os_error(libc::ESRCH));
        assert!(matches!(err, VeilError::ProcessGone { pid: 42 }));

        let err = VeilError::from_process_io(42, std::io::Error::from_raw_os_error(libc::EPERM));
        assert!(matches!(err, VeilError::PermissionDenied { .. }));
    }
}
