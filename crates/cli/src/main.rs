//! rowstream CLI
//!
//! Operational tooling for rowstream applications: inspect and clear local
//! state directories and show the effective configuration.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{CliResult, ConfigCommand, StateCommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "rowstream",
    version,
    about = "Tooling for rowstream stream processing applications",
    long_about = "Tooling for rowstream stream processing applications.\n\n\
                  Features:\n\
                  - List local store partitions and their offsets\n\
                  - Clear the local state of a consumer group\n\
                  - Show the effective application configuration"
)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Local state operations
    #[command(name = "state", about = "Inspect and clear local state")]
    State {
        #[command(subcommand)]
        command: StateCommand,
    },

    /// Configuration
    #[command(name = "config", about = "Inspect configuration")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> CliResult<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    match cli.command {
        Commands::State { command } => command.execute(),
        Commands::Config { command } => command.execute(),
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("rowstream=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("rowstream=warn")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
