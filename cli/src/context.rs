use crate::Cli;
use crate::config::Settings;
use crate::progress::BarProgress;
use anyhow::{Context as _, Result, anyhow, bail};
use onesnap_backends::{LocalStore, RetryingStore, S3Config, S3Store, s3::DEFAULT_REGION};
use onesnap_core::{CancelToken, EncryptionKey, RemoteStore, RunController};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ENV_ENDPOINT: &str = "ONESNAP_ENDPOINT";
pub const ENV_ACCESS_KEY: &str = "ONESNAP_ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "ONESNAP_SECRET_KEY";
pub const ENV_REGION: &str = "ONESNAP_REGION";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `file:///dir`: every bucket is a sub-directory of `dir`.
    Local(PathBuf),
    S3(String),
}

impl Endpoint {
    pub fn parse(value: &str) -> Result<Self> {
        if value.is_empty() {
            bail!("{} is empty", ENV_ENDPOINT);
        }
        match value.strip_prefix("file://") {
            Some(dir) if dir.starts_with('/') => Ok(Self::Local(PathBuf::from(dir))),
            Some(_) => bail!("file endpoints need an absolute path: {}", value),
            None => Ok(Self::S3(value.to_string())),
        }
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn validate_bucket(bucket: &str) -> Result<()> {
    let valid = !bucket.is_empty()
        && bucket != "."
        && bucket != ".."
        && !bucket.contains('/');
    if !valid {
        bail!("Invalid bucket name: {:?}", bucket);
    }
    Ok(())
}

/// Settings plus a connected store for one command.
pub struct Context {
    pub settings: Settings,
    pub store: Arc<dyn RemoteStore>,
    quiet: bool,
}

impl Context {
    pub async fn open(cli: &Cli) -> Result<Self> {
        let settings = Settings::load(cli.config.as_deref())?;
        let bucket = cli
            .bucket
            .as_deref()
            .ok_or_else(|| anyhow!("Bucket required (--bucket or ONESNAP_BUCKET)"))?;
        validate_bucket(bucket)?;

        let endpoint = env(ENV_ENDPOINT)
            .ok_or_else(|| anyhow!("{} must be set", ENV_ENDPOINT))
            .and_then(|value| Endpoint::parse(&value))?;

        let store: Arc<dyn RemoteStore> = match endpoint {
            Endpoint::Local(dir) => {
                let path = dir.join(bucket);
                info!(path = %path.display(), "Using local bucket");
                Arc::new(RetryingStore::new(LocalStore::new(path), settings.transport.clone()))
            }
            Endpoint::S3(url) => {
                let config = S3Config {
                    endpoint: url.clone(),
                    access_key: env(ENV_ACCESS_KEY)
                        .ok_or_else(|| anyhow!("{} must be set", ENV_ACCESS_KEY))?,
                    secret_key: env(ENV_SECRET_KEY)
                        .ok_or_else(|| anyhow!("{} must be set", ENV_SECRET_KEY))?,
                    region: env(ENV_REGION).unwrap_or_else(|| DEFAULT_REGION.to_string()),
                    bucket: bucket.to_string(),
                };
                info!(endpoint = %url, bucket = %bucket, "Using S3 bucket");
                Arc::new(RetryingStore::new(S3Store::new(config)?, settings.transport.clone()))
            }
        };

        store
            .init()
            .await
            .with_context(|| format!("Failed to open bucket {}", bucket))?;

        Ok(Self {
            settings,
            store,
            quiet: cli.quiet,
        })
    }

    /// Controller for commands that never touch encrypted data.
    pub fn controller(&self) -> RunController {
        RunController::new(self.store.clone(), self.settings.engine.clone())
    }

    /// Controller with the password-derived key, terminal progress and
    /// cancellation on SIGINT/SIGTERM.
    pub fn keyed_controller(&self, cli: &Cli) -> Result<RunController> {
        let password = password(cli)?;
        debug!("Deriving encryption key");
        let key = EncryptionKey::derive(&password, &self.settings.engine.kdf)?;

        let cancel = CancelToken::new();
        watch_signals(cancel.clone());

        Ok(self
            .controller()
            .with_key(key)
            .with_cancel(cancel)
            .with_progress(Arc::new(BarProgress::new(self.quiet))))
    }
}

pub fn required_path<'a>(cli: &'a Cli, what: &str) -> Result<&'a Path> {
    cli.path
        .as_deref()
        .ok_or_else(|| anyhow!("{} required (--path or ONESNAP_PATH)", what))
}

fn password(cli: &Cli) -> Result<String> {
    let password = match &cli.password {
        Some(password) => password.clone(),
        None => rpassword::prompt_password("Enter bucket password: ")
            .context("Failed to read password")?,
    };
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password)
}

/// Turns the first SIGINT or SIGTERM into a cancellation request. The run
/// stops after the file or object in flight.
fn watch_signals(cancel: CancelToken) {
    tokio::spawn(async move {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGTERM");
                    None
                }
            };

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Cannot listen for SIGINT");
                        return;
                    }
                }
                Some(()) = async {
                    match terminate.as_mut() {
                        Some(signal) => signal.recv().await,
                        None => std::future::pending::<Option<()>>().await,
                    }
                } => {}
            }

            if cancel.is_cancelled() {
                warn!("Already stopping, waiting for the current transfer to finish");
            } else {
                warn!("Interrupt received, stopping after the current transfer");
                cancel.cancel();
            }
        }
    });
}
