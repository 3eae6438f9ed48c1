use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loopvol_core::{host::system_runner, init_observability, Config, VolumeDriver};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "loopvol")]
#[command(about = "Loopback-file-backed volumes", long_about = None)]
struct Cli {
    /// JSON config file; LOOPVOL_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and format a volume
    Create {
        /// Volume name
        name: String,

        /// Volume options (KEY=VALUE): size, sparse, fs, uid, gid, mode
        #[arg(short = 'o', long = "opt")]
        opts: Vec<String>,
    },

    /// List volumes
    Ls,

    /// Show volume details as JSON
    Inspect {
        /// Volume name
        name: String,
    },

    /// Print a volume's mountpoint
    Path {
        /// Volume name
        name: String,
    },

    /// Mount a volume on behalf of a consumer
    Mount {
        /// Volume name
        name: String,

        /// Consumer (lease) id
        id: String,
    },

    /// Release a consumer's lease, unmounting when none remain
    Unmount {
        /// Volume name
        name: String,

        /// Consumer (lease) id
        id: String,
    },

    /// Delete an unmounted volume
    Rm {
        /// Volume name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    }
    .with_overrides(|key| std::env::var(key).ok())?;

    init_observability(&config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize observability: {}", e))?;

    let driver = VolumeDriver::new(&config, system_runner()).context("Invalid configuration")?;

    match cli.command {
        Commands::Create { name, opts } => {
            let options = commands::parse_opts(&opts)?;
            commands::volume::create(&driver, &name, &options).await?;
        }

        Commands::Ls => {
            commands::volume::ls(&driver).await?;
        }

        Commands::Inspect { name } => {
            commands::volume::inspect(&driver, &name).await?;
        }

        Commands::Path { name } => {
            let path = driver.path(&name).await?;
            println!("{}", path.display());
        }

        Commands::Mount { name, id } => {
            commands::volume::mount(&driver, &name, &id).await?;
        }

        Commands::Unmount { name, id } => {
            commands::volume::unmount(&driver, &name, &id).await?;
        }

        Commands::Rm { name } => {
            commands::volume::rm(&driver, &name).await?;
        }
    }

    Ok(())
}
