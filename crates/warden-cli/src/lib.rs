//! # warden-cli
//!
//! Command-line interface for the Warden plugin host.
//!
//! ## Commands
//!
//! - `warden run`: Run a WebAssembly plugin in a sandbox until Ctrl-C
//! - `warden config`: Show the effective configuration
//! - `warden permissions`: Check permission strings
//! - `warden version`: Show version and build info

pub mod commands;
pub mod logging;
pub mod services;

pub use commands::Cli;
