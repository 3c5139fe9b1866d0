use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use vouch_core::CallConfig;

/// CLI configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Base directory for mailboxes and pins.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Signaling mailbox directory (default `<data_dir>/mailboxes`).
    #[serde(default)]
    pub mailbox_dir: Option<PathBuf>,

    /// Pinned key file (default `<data_dir>/pins.json`).
    #[serde(default)]
    pub pins_file: Option<PathBuf>,

    #[serde(default)]
    pub call: CallConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("vouch"))
        .unwrap_or_else(|| PathBuf::from(".vouch"))
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mailbox_dir: None,
            pins_file: None,
            call: CallConfig::default(),
        }
    }
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.mailbox_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("mailboxes"))
    }

    pub fn pins_file(&self) -> PathBuf {
        self.pins_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("pins.json"))
    }
}
