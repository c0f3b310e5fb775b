//! # veil-common
//!
//! Shared types for the veil process-hiding monitor:
//! - Common error types
//! - Standard procfs paths

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{VeilError, VeilResult};
pub use paths::VeilPaths;
