//! Virtual map node CLI
//!
//! Inspect and verify snapshot directories, serve them to lagging peers, and
//! catch a snapshot up from a peer.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, registry, EnvFilter};
use vmap_node::{commands, NodeConfig};

#[derive(Parser)]
#[command(name = "vmap")]
#[command(about = "Versioned merkle map node tooling")]
#[command(version)]
struct Cli {
    /// Node configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the shape and root hash of a snapshot
    Inspect {
        /// Snapshot directory
        dir: PathBuf,
    },

    /// Recompute every hash of a snapshot
    Verify {
        /// Snapshot directory
        dir: PathBuf,
    },

    /// Serve a snapshot to reconnecting peers
    Teach {
        /// Snapshot directory
        dir: PathBuf,

        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:7420")]
        listen: SocketAddr,
    },

    /// Catch a snapshot up from a teaching peer
    Learn {
        /// Snapshot directory to start from
        dir: PathBuf,

        /// Teacher address
        #[arg(short, long)]
        peer: SocketAddr,

        /// Where to write the reconnected snapshot
        #[arg(short, long)]
        out: PathBuf,

        /// Scratch directory for the tree under construction
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    match cli.command {
        Commands::Inspect { dir } => {
            let summary =
                tokio::task::spawn_blocking(move || commands::inspect(&dir, &config)).await??;
            println!("{summary}");
        }

        Commands::Verify { dir } => {
            let bad = tokio::task::spawn_blocking(move || commands::verify(&dir, &config)).await??;
            if let Some(path) = bad {
                println!("hash mismatch at path {path}");
                return Ok(ExitCode::FAILURE);
            }
            println!("ok");
        }

        Commands::Teach { dir, listen } => {
            commands::teach(dir, listen, config).await?;
        }

        Commands::Learn {
            dir,
            peer,
            out,
            work_dir,
        } => {
            let work_dir = work_dir.unwrap_or_else(|| out.with_extension("partial"));
            let root = commands::learn(dir, peer, out, work_dir, config).await?;
            println!("{root}");
        }
    }

    Ok(ExitCode::SUCCESS)
}
