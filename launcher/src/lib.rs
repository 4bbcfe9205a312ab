//! AppVM session launcher library
//!
//! Starts containerised desktop applications on demand: provisions a
//! per-session message bus subscription, runs the application container and
//! returns where a client can reach its display.

pub mod broker;
pub mod config;
pub mod container;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod metrics;
pub mod models;

pub use config::LauncherConfig;
pub use error::LaunchError;
pub use launcher::{LauncherState, SessionLauncher};
pub use models::{ConnectivityDescriptor, LaunchRequest};
