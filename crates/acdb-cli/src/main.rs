//! Command-line front end for the audio calibration and graph-services
//! runtime.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "acdb-rt")]
#[command(author, version, about = "Audio calibration database and graph-services runtime CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a read-only key-vector query against a chunked ACDB file.
    Query(commands::query::QueryArgs),

    /// Register or unregister a database with a registry for the duration
    /// of this invocation.
    Database(commands::database::DatabaseArgs),

    /// Drive a full open/start/write/close lifecycle against an in-process
    /// loopback transport, for exercising the graph runtime without real
    /// satellite hardware.
    Simulate(commands::simulate::SimulateArgs),

    /// Inspect or initialize the runtime configuration file.
    Config(commands::config::ConfigArgs),
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    tracing::debug!(command = ?std::mem::discriminant(&cli.command), "dispatching command");

    match cli.command {
        Commands::Query(args) => commands::query::run(args),
        Commands::Database(args) => commands::database::run(args),
        Commands::Simulate(args) => commands::simulate::run(args),
        Commands::Config(args) => commands::config::run(args),
    }
}
