//! Inspect or initialize the runtime configuration file.

use std::path::PathBuf;

use acdb_config::{paths, RuntimeConfig};
use clap::{Args, Subcommand};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a default configuration file, refusing to overwrite an
    /// existing one unless `--force` is given.
    Init {
        /// Path to write; defaults to the platform user config location.
        #[arg(long)]
        path: Option<PathBuf>,

        #[arg(long)]
        force: bool,
    },

    /// Print the active configuration as JSON.
    Show {
        /// Path to read; defaults to the platform user config location.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

pub fn run(args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Init { path, force } => {
            let path = path.unwrap_or_else(paths::default_config_file);
            if path.exists() && !force {
                anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
            }
            RuntimeConfig::default().save(&path)?;
            println!("wrote default configuration to {}", path.display());
        }
        ConfigCommand::Show { path } => {
            let path = path.unwrap_or_else(paths::default_config_file);
            let config = RuntimeConfig::load(&path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
