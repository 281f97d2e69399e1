use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use gantry_cli::{commands, ApiArgs};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the newest published version
    Latest {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Inspect the local install's ledger
    Status {
        /// Install directory
        path: Utf8PathBuf,
    },
    /// Bring an install up to the newest published version
    Sync {
        #[command(flatten)]
        api: ApiArgs,
        /// Install directory
        path: Utf8PathBuf,
        /// Download speed limit in MB/s
        #[arg(long)]
        limit_mb: Option<u64>,
        /// External delta tool command template
        #[arg(long)]
        patch_cmd: Option<String>,
        /// Skip rehashing tracked files during the consistency check
        #[arg(long)]
        shallow: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("default subscriber");

    match cli.command {
        Commands::Latest { api } => commands::cmd_latest(api).await?,
        Commands::Status { path } => commands::cmd_status(path)?,
        Commands::Sync {
            api,
            path,
            limit_mb,
            patch_cmd,
            shallow,
        } => commands::cmd_sync(api, path, limit_mb, patch_cmd, shallow).await?,
    }

    Ok(())
}
