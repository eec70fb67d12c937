mod commands;
mod config;
mod context;
mod progress;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use commands::{
    create::CreateCommand,
    lock::{LockCommand, StatusCommand, UnlockCommand},
    restore::RestoreCommand,
    verify::VerifyCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "onesnap",
    version,
    about = "Single-copy, deduplicated, encrypted backups to an S3 bucket",
    long_about = "onesnap keeps exactly one encrypted, deduplicated snapshot of one directory \
                  in one bucket. Connection parameters come from ONESNAP_ENDPOINT, \
                  ONESNAP_ACCESS_KEY, ONESNAP_SECRET_KEY and ONESNAP_REGION."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "ONESNAP_BUCKET", help = "Bucket holding the snapshot")]
    bucket: Option<String>,

    #[arg(
        long,
        global = true,
        env = "ONESNAP_PASSWORD",
        hide_env_values = true,
        help = "Encryption password (prompted for if absent)"
    )]
    password: Option<String>,

    #[arg(long, global = true, env = "ONESNAP_PATH", help = "Directory to back up or restore into")]
    path: Option<PathBuf>,

    #[arg(long, global = true, env = "ONESNAP_CONFIG", help = "Settings file")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Back up --path, replacing the bucket's snapshot")]
    Create(CreateCommand),

    #[command(about = "Restore the snapshot into an empty --path")]
    Restore(RestoreCommand),

    #[command(about = "Download and authenticate every stored object")]
    Verify(VerifyCommand),

    #[command(about = "Lock the bucket until it is unlocked")]
    Lock(LockCommand),

    #[command(about = "Remove the bucket lock, whoever holds it")]
    Unlock(UnlockCommand),

    #[command(about = "Show whether the bucket is locked")]
    Status(StatusCommand),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    debug!("Starting onesnap");

    match cli.command {
        Commands::Create(ref cmd) => cmd.run(&cli).await,
        Commands::Restore(ref cmd) => cmd.run(&cli).await,
        Commands::Verify(ref cmd) => cmd.run(&cli).await,
        Commands::Lock(ref cmd) => cmd.run(&cli).await,
        Commands::Unlock(ref cmd) => cmd.run(&cli).await,
        Commands::Status(ref cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "onesnap_cli={level},onesnap_core={level},onesnap_backends={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Setting default subscriber failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "onesnap", "create", "--bucket", "b", "--path", "/srv", "--skip", "cache", "--force",
        ])
        .unwrap();

        assert_eq!(cli.bucket.as_deref(), Some("b"));
        assert_eq!(cli.path, Some(PathBuf::from("/srv")));
        assert!(matches!(cli.command, Commands::Create(_)));
    }
}
