//! `finch` - concurrent downloads from and uploads to S3-compatible storage.

mod config;
mod output;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "finch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Number of concurrent transfers (overrides the config file)
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Path to a TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print one JSON event per line instead of progress lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Download objects into a local directory
    Download(DownloadArgs),

    /// Upload local files into a bucket
    Upload(UploadArgs),
}

#[derive(Args)]
pub struct DownloadArgs {
    /// Source bucket
    #[arg(short, long)]
    pub bucket: String,

    /// Destination directory
    #[arg(short, long, default_value = ".")]
    pub dest: PathBuf,

    /// Object keys to download
    #[arg(required = true)]
    pub keys: Vec<String>,
}

#[derive(Args)]
pub struct UploadArgs {
    /// Destination bucket
    #[arg(short, long)]
    pub bucket: String,

    /// Key prefix the files are placed under
    #[arg(short, long)]
    pub folder: Option<String>,

    /// Files to upload
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr so `--json` output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let summary = run::run(cli).await?;
    Ok(if summary.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
