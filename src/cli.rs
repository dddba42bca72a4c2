// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines global output flags and the deploy, stop and render subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dockyard")]
#[command(about = "Build, deploy and route compose applications on a single-node swarm")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print only the final result
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// Emit JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Settings file (defaults to dockyard.yml discovery in the current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and deploy an application, then configure its routing
    Deploy {
        /// Application manifest
        manifest: PathBuf,
    },

    /// Remove an application's stack and its routing
    Stop {
        /// Application manifest
        manifest: PathBuf,
    },

    /// Generate the stack file without deploying it
    Render {
        /// Application manifest
        manifest: PathBuf,
    },
}
