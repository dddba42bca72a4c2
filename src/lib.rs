// ABOUTME: Library root for dockyard - exposes the deployment engine for the CLI and tests.
// ABOUTME: The main binary is in main.rs.

pub mod cancel;
pub mod cluster;
pub mod config;
pub mod deploy;
pub mod diagnostics;
pub mod error;
pub mod git;
pub mod model;
pub mod notify;
pub mod output;
pub mod process;
pub mod progress;
pub mod routing;
pub mod store;
pub mod types;
