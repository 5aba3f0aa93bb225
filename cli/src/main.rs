mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    download::DownloadCommand, list::ListCommand, obfuscate::ObfuscateCommand,
    upload::UploadCommand, verify::VerifyCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "offsite",
    about = "Ship backup archives to remote storage",
    long_about = "Offsite uploads backup archives to Dropbox, FTP/SFTP, WebDAV or Nextcloud and prunes old ones"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "OFFSITE_CONFIG", help = "Path to config.toml")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(name = "test", about = "Upload and remove a test file on every enabled backend")]
    Verify(VerifyCommand),

    #[command(about = "Upload a backup and prune old ones")]
    Upload(UploadCommand),

    #[command(about = "Download a backup into the local directory")]
    Download(DownloadCommand),

    #[command(about = "List backups below a remote folder")]
    List(ListCommand),

    #[command(about = "Print the stored form of a secret for config.toml")]
    Obfuscate(ObfuscateCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    debug!("Starting offsite");

    match cli.command {
        Commands::Verify(ref cmd) => cmd.run(&cli).await,
        Commands::Upload(ref cmd) => cmd.run(&cli).await,
        Commands::Download(ref cmd) => cmd.run(&cli).await,
        Commands::List(ref cmd) => cmd.run(&cli).await,
        Commands::Obfuscate(ref cmd) => cmd.run(),
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "offsite={level},offsite_core={level},offsite_backends={level}"
        ))
    });

    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }
}
