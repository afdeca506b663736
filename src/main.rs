//! sandboxd CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

/// sandboxd - per-learner container sandboxes
#[derive(Parser, Debug)]
#[command(name = "sandboxd")]
#[command(about = "Serve per-learner container sandboxes over a websocket terminal")]
#[command(
    long_about = "sandboxd provisions one container per learner and OS flavor and \
streams a terminal to the browser over a JSON websocket protocol.\n\n\
Commands are screened against a denylist, audited, and judged by \
lesson validators.\n\n\
Quick start:\n  \
sandboxd serve --listen 127.0.0.1:8080\n  \
sandboxd policy check rm -rf /"
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the sandbox server
    Serve(cli::serve::ServeCmd),

    /// Inspect the command denylist
    #[command(subcommand)]
    Policy(cli::policy::PolicyCmd),

    /// Export the OpenAPI document
    Openapi(cli::openapi::OpenapiCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging();

    tracing::debug!(version = sandboxd::VERSION, "starting sandboxd");

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(),
        Commands::Policy(cmd) => cmd.run(),
        Commands::Openapi(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandboxd=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
