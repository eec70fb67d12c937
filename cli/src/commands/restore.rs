use crate::context::{Context, required_path};
use anyhow::Result;
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let target = required_path(cli, "Restore target")?;
        let context = Context::open(cli).await?;
        let mut controller = context.keyed_controller(cli)?;

        info!("Restoring snapshot into {}", target.display());
        let report = controller.restore(target).await?;

        println!("Restored {} entries into {}", report.entries, target.display());
        println!("  Downloaded:    {} objects", report.objects);
        println!("  Copied:        {} duplicates", report.copies);
        println!("  Linked:        {} hard links", report.links);
        println!(
            "  Size:          {:.2} MB",
            report.total_size as f64 / 1024.0 / 1024.0
        );
        Ok(())
    }
}
