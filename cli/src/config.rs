use anyhow::{Context, Result};
use onesnap_backends::RetryConfig;
use onesnap_core::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Optional settings file. Every key has a default, so an absent file and
/// an empty file behave the same.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub transport: RetryConfig,
    pub engine: EngineConfig,
}

impl Settings {
    /// Loads `explicit` if given (it must exist), otherwise the default
    /// location if a file is there.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    debug!("No settings file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = Self::parse(&text)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text)?;
        settings.engine.validate()?;
        Ok(settings)
    }
}

pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "onesnap").map(|dirs| dirs.config_dir().join("config.toml"))
}
