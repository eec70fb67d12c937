use crate::context::Context;
use anyhow::{Result, bail};
use clap::Args;

#[derive(Args)]
pub struct VerifyCommand {}

impl VerifyCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let context = Context::open(cli).await?;
        let mut controller = context.keyed_controller(cli)?;

        let report = controller.verify().await?;

        for problem in &report.problems {
            println!("{} {}: {}", problem.kind, problem.digest.short_string(), problem.message);
            for path in &problem.paths {
                println!("    {}", path.display());
            }
        }

        println!(
            "Checked {} objects for {} entries, {} problems",
            report.checked,
            report.entries,
            report.problems.len()
        );

        if !report.is_ok() {
            bail!("Verification failed for {} objects", report.problems.len());
        }
        Ok(())
    }
}
