// ABOUTME: TOML configuration for mpr-exchange
// ABOUTME: Optional file tuning the source filters and destination schema

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::exchange::SourceOptions;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub transfer_sheet: TransferSheetConfig,
    pub destination: DestinationConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSheetConfig {
    /// Oldest creation day of a transfer sheet offered by the source. Defaults to today.
    pub date_period_begin: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Schema holding the destination tables.
    pub schema: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
        }
    }
}

impl ExchangeConfig {
    /// `<config dir>/mpr-exchange/exchange.toml`, when the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mpr-exchange").join("exchange.toml"))
    }

    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one the default location is tried
    /// and a missing file yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Config file {} does not exist", path.display());
            }
            return Self::from_file(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: ExchangeConfig = toml::from_str(text)?;
        if config.destination.schema.trim().is_empty() {
            bail!("destination.schema must not be empty");
        }
        Ok(config)
    }

    pub fn source_options(&self) -> SourceOptions {
        let mut options = SourceOptions::default();
        if let Some(day) = self.transfer_sheet.date_period_begin {
            options.transfer_sheets_since = day;
        }
        options
    }
}
