// ABOUTME: Entry point for the dockyard CLI application.
// ABOUTME: Parses arguments, initializes tracing and dispatches to command handlers.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use dockyard::error::Result;
use dockyard::output::{Output, OutputMode};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // -v wins over RUST_LOG; otherwise RUST_LOG, then warnings only
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    };
    let output = Output::new(mode);

    if let Err(e) = run(cli, output.clone()).await {
        output.error(&e.to_string());
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: Output) -> Result<()> {
    let settings = commands::load_settings(cli.config.as_deref())?;
    match cli.command {
        Commands::Deploy { manifest } => {
            let manifest = commands::load_manifest(&manifest)?;
            commands::deploy(settings, manifest, output).await
        }
        Commands::Stop { manifest } => {
            let manifest = commands::load_manifest(&manifest)?;
            commands::stop(settings, manifest, output).await
        }
        Commands::Render { manifest } => {
            let manifest = commands::load_manifest(&manifest)?;
            commands::render(settings, manifest, output).await
        }
    }
}
