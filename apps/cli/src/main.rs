//! Cloudgate command line entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloudgate")]
#[command(about = "Chunked, resumable uploads with content dedup")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.config/cloudgate/cloudgate.toml)
    #[arg(long, global = true, env = "CLOUDGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Store root (overrides the configuration file)
    #[arg(long, global = true, env = "CLOUDGATE_STORE")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, or stdin with `-`
    Upload {
        /// Local file path, or `-` to read stdin
        file: String,
        /// Destination as `container/name`
        #[arg(long)]
        dest: String,
        /// Declared size in bytes; corrected if the source disagrees
        #[arg(long)]
        size: Option<u64>,
        /// Concurrent chunk uploads
        #[arg(long)]
        concurrency: Option<usize>,
        /// Preferred chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Print the stored object as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show the object stored at a destination
    Stat {
        /// Destination as `container/name`
        dest: String,
        /// Print as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store.root = store;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: config::Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, canceling");
            on_signal.cancel();
        }
    });

    match command {
        Commands::Upload {
            file,
            dest,
            size,
            concurrency,
            chunk_size,
            json,
        } => {
            let args = app::UploadArgs {
                file: &file,
                dest: &dest,
                size,
                concurrency,
                chunk_size,
                json,
            };
            app::upload(config, args, &cancel).await
        }
        Commands::Stat { dest, json } => app::stat(config, &dest, json).await,
    }
}
