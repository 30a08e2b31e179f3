//! Replay Configuration
//!
//! Settings can come from a TOML file; command-line flags and environment
//! variables override individual values on top of it.

use crate::replay::clock::{parse_timestamp, SpeedFactor};
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::replayer::ReplayOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PRICE_FOLDER: &str = "../../data/prices";
pub const DEFAULT_DB_PATH: &str = "prices.db";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Main configuration for a replay run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Folder searched recursively for `YYYY-MM-DD-prices.csv` partitions
    pub price_folder: PathBuf,

    /// SQLite database receiving the replayed rows
    pub db_path: PathBuf,

    /// Historical seconds replayed per real second
    pub speed_factor: SpeedFactor,

    /// Replay only events strictly after this instant, ignoring the store's
    /// high-water mark
    pub resume_at: Option<String>,

    /// How long a commit may wait for the database write lock
    pub busy_timeout_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            price_folder: PathBuf::from(DEFAULT_PRICE_FOLDER),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            speed_factor: SpeedFactor::REAL_TIME,
            resume_at: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl ReplayConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> ReplayResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ReplayError::Config(format!(
            "cannot read {}: {}",
            path.display(),
            e
        )))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ReplayResult<Self> {
        toml::from_str(text).map_err(|e| ReplayError::Config(e.to_string()))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Check every value and produce the options a run needs.
    pub fn to_options(&self) -> ReplayResult<ReplayOptions> {
        let resume_override = match self.resume_at.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| {
                ReplayError::Config(format!("resume_at is not a timestamp: {:?}", raw))
            })?),
        };

        Ok(ReplayOptions {
            price_folder: self.price_folder.clone(),
            speed: self.speed_factor,
            resume_override,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_real_time() {
        let config = ReplayConfig::default();
        let options = config.to_options().unwrap();
        assert_eq!(options.speed, SpeedFactor::REAL_TIME);
        assert!(options.resume_override.is_none());
        assert_eq!(options.price_folder, PathBuf::from(DEFAULT_PRICE_FOLDER));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ReplayConfig::from_toml_str(
            r#"
            speed_factor = 60
            resume_at = "2024-01-01 09:00:00+01"
            "#,
        )
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.busy_timeout(), Duration::from_secs(30));

        let options = config.to_options().unwrap();
        assert_eq!(options.speed.get(), 60.0);
        assert_eq!(options.resume_override, parse_timestamp("2024-01-01T08:00:00Z"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = ReplayConfig::from_toml_str("speed_factor = 0").unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("speed factor"));
        assert!(ReplayConfig::from_toml_str("speed_factor = -1.5").is_err());

        let config = ReplayConfig {
            resume_at: Some("last tuesday".into()),
            ..ReplayConfig::default()
        };
        assert!(config.to_options().unwrap_err().to_string().contains("resume_at"));

        assert!(ReplayConfig::from_toml_str("speed_factor = \"fast\"").is_err());
    }

    #[test]
    fn test_blank_resume_is_ignored() {
        let config = ReplayConfig {
            resume_at: Some("  ".into()),
            ..ReplayConfig::default()
        };
        assert!(config.to_options().unwrap().resume_override.is_none());
    }
}
