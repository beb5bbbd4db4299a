//! Foundry Instance Manager - Run isolated, container-backed Foundry VTT instances
//!
//! Each instance gets its own data directory, port and admin key, and shares a
//! common image plus one shared data area with every other instance on the host.

pub mod cli;
pub mod core;
pub mod error;
pub mod fetch;
pub mod persistence;
pub mod runtime;

pub use error::{ErrorKind, ManagerError, Result};

/// Application name constant
pub const APP_NAME: &str = "Foundry Instance Manager";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
