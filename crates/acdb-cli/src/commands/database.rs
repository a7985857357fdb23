//! Database registration (C3): add or remove a `.acdb` file set against a
//! registry that lives only for this invocation.

use std::path::PathBuf;

use acdb_registry::Registry;
use clap::{Args, Subcommand};

#[derive(Args)]
pub struct DatabaseArgs {
    #[command(subcommand)]
    command: DatabaseCommand,
}

#[derive(Subcommand)]
enum DatabaseCommand {
    /// Register a database and report its assigned handle.
    Add {
        /// Path to the chunked `.acdb` file.
        acdb_path: PathBuf,

        /// Directory the registry may write delta files into.
        #[arg(long)]
        writable_dir: Option<PathBuf>,
    },

    /// Load a database and immediately unregister it, as a smoke test for a
    /// file set before wiring it into a long-running service.
    Validate {
        acdb_path: PathBuf,
    },
}

pub fn run(args: DatabaseArgs) -> anyhow::Result<()> {
    let registry = Registry::new();

    match args.command {
        DatabaseCommand::Add {
            acdb_path,
            writable_dir,
        } => {
            let handle = registry.add(acdb_path.clone(), None, writable_dir)?;
            println!("registered {} as {handle:?}", acdb_path.display());
        }
        DatabaseCommand::Validate { acdb_path } => {
            let handle = registry.add(acdb_path.clone(), None, None)?;
            registry.remove(handle)?;
            println!("{} loads cleanly", acdb_path.display());
        }
    }

    Ok(())
}
