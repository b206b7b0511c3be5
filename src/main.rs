use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dimse::{DimseScu, DimseStatus, RemoteNode};
use mupacs::config::Config;
use mupacs::Pacs;

#[derive(Parser)]
#[command(name = "mupacs")]
#[command(about = "Minimal PACS node: DICOM Store, Query and Retrieve", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "mupacs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the archive SCP (default)
    Serve,
    /// Archive every DICOM file below a directory
    Import {
        /// Directory to scan recursively
        dir: PathBuf,
    },
    /// Send a C-ECHO to a remote node
    Echo {
        /// Remote node as AET@host:port
        node: String,
    },
    /// Print index statistics
    Stats,
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if path.exists() {
        Config::from_file(path).with_context(|| format!("loading {}", path.display()))
    } else {
        eprintln!("{} not found, using defaults", path.display());
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    mupacs::init_logging(&config.logging)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => mupacs::run(config).await?,
        Commands::Import { dir } => {
            let pacs = Pacs::open(config)?;
            let summary = mupacs::import::import_directory(pacs.storage_service(), &dir).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Echo { node } => {
            let node: RemoteNode = node.parse()?;
            let scu = DimseScu::new(config.dimse);
            let status = scu.echo(&node).await?;
            if status != DimseStatus::Success {
                bail!("C-ECHO to {} returned {:?}", node, status);
            }
            println!("C-ECHO to {} succeeded", node);
        }
        Commands::Stats => {
            let pacs = Pacs::open(config)?;
            let stats = pacs.index().statistics()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
