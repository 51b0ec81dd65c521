//! Shared utilities for the harness
//!
//! - Subprocess helpers: command logging and process-tree termination
//! - Path helpers: normalization, file grep and test-name sanitizing

pub mod path;
pub mod process;

pub use path::*;
pub use process::*;
