use crate::context::Context;
use anyhow::Result;
use clap::Args;
use onesnap_core::LockState;

#[derive(Args)]
pub struct LockCommand {}

impl LockCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let context = Context::open(cli).await?;
        let record = context.controller().lock().await?;

        println!("Bucket locked by {}", record.holder());
        println!("Run `onesnap unlock` to release it");
        Ok(())
    }
}

#[derive(Args)]
pub struct UnlockCommand {}

impl UnlockCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let context = Context::open(cli).await?;

        match context.controller().unlock().await? {
            Some(record) => println!("Removed lock held by {} ({})", record.holder(), record.mode),
            None => println!("No readable lock record, bucket is unlocked"),
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let context = Context::open(cli).await?;
        let state = context.controller().status().await?;

        println!("Bucket is {}", state);
        if let LockState::LockedByRun(_) = state {
            println!("If that run is no longer alive, remove the lock with `onesnap unlock`");
        }
        Ok(())
    }
}
