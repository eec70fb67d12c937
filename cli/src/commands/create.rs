use crate::context::{Context, required_path};
use anyhow::Result;
use clap::Args;
use onesnap_core::CreateOptions;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct CreateCommand {
    #[arg(long, help = "Path to leave out, relative to --path (repeatable)")]
    skip: Vec<PathBuf>,

    #[arg(long, help = "Replace a snapshot taken from another host, path or password")]
    force: bool,
}

impl CreateCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let source = required_path(cli, "Source path")?;
        let context = Context::open(cli).await?;
        let mut controller = context.keyed_controller(cli)?;

        let options = CreateOptions {
            skip: self.skip.clone(),
            force: self.force,
        };

        info!("Creating snapshot of {}", source.display());
        let report = controller.create(source, &options).await?;

        println!("Snapshot {} created", report.generation);
        println!("  Entries:       {}", report.entries);
        println!("  Skipped:       {}", report.skipped);
        println!(
            "  Size:          {:.2} MB",
            report.total_size as f64 / 1024.0 / 1024.0
        );
        println!(
            "  Uploaded:      {} objects ({:.2} MB)",
            report.transfer.uploaded_objects,
            report.transfer.uploaded_bytes as f64 / 1024.0 / 1024.0
        );
        println!(
            "  Deduplicated:  {} objects already stored ({} files reused)",
            report.transfer.deduplicated, report.transfer.reused_files
        );
        println!("  Pruned:        {} keys", report.pruned);
        Ok(())
    }
}
