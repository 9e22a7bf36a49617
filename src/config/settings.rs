//! Application settings loaded from config.toml
//!
//! Every section is optional; missing sections fall back to the defaults the
//! marketplace ships with (the built-in voucher catalog, the standard points
//! rules and a 3 second subscription retry delay).

use super::catalog::{VoucherConfig, default_catalog};
use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration structure representing the entire config.toml file
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Voucher catalog to seed
    #[serde(default = "default_catalog")]
    pub vouchers: Vec<VoucherConfig>,
    /// Points awarded per action
    #[serde(default)]
    pub points: PointsRules,
    /// Live subscription tuning
    #[serde(default)]
    pub realtime: RealtimeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vouchers: default_catalog(),
            points: PointsRules::default(),
            realtime: RealtimeSettings::default(),
        }
    }
}

/// How many points each action is worth
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PointsRules {
    /// One-time reward for the first completed trade
    pub first_trade: i64,
    /// Reward for every later trade
    pub completed_trade: i64,
    /// Every this many trades a milestone bonus is paid
    pub milestone_interval: i32,
    /// Size of the milestone bonus
    pub milestone_bonus: i64,
    /// Welcome bonus on registration
    pub signup_bonus: i64,
    /// Reward for verifying the account
    pub verify_account: i64,
}

impl Default for PointsRules {
    fn default() -> Self {
        Self {
            first_trade: 200,
            completed_trade: 50,
            milestone_interval: 10,
            milestone_bonus: 500,
            signup_bonus: 100,
            verify_account: 100,
        }
    }
}

impl PointsRules {
    /// Rejects negative rewards and a negative milestone interval.
    ///
    /// A reward of 0 switches that reward off; an interval of 0 disables milestones.
    pub fn validate(&self) -> Result<()> {
        let rewards = [
            ("first_trade", self.first_trade),
            ("completed_trade", self.completed_trade),
            ("milestone_bonus", self.milestone_bonus),
            ("signup_bonus", self.signup_bonus),
            ("verify_account", self.verify_account),
        ];
        if let Some((name, value)) = rewards.iter().find(|(_, value)| *value < 0) {
            return Err(Error::Config {
                message: format!("points.{name} cannot be negative (got {value})"),
            });
        }
        if self.milestone_interval < 0 {
            return Err(Error::Config {
                message: format!(
                    "points.milestone_interval cannot be negative (got {})",
                    self.milestone_interval
                ),
            });
        }
        Ok(())
    }
}

/// Tuning for live subscriptions
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RealtimeSettings {
    /// Delay before a failed listener reloads, in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: 3000,
        }
    }
}

impl RealtimeSettings {
    /// Retry delay as a `Duration`.
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Loads settings from a TOML file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - A field has the wrong type
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path_ref = path.as_ref();
    debug!("Loading settings from {:?}", path_ref);
    let contents = std::fs::read_to_string(path_ref).map_err(|e| Error::Config {
        message: format!("Failed to read config file {}: {e}", path_ref.display()),
    })?;

    parse_settings(&contents)
}

/// Parses settings from TOML text and validates the points rules.
pub fn parse_settings(contents: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse config.toml: {e}"),
    })?;
    settings.points.validate()?;
    Ok(settings)
}

/// Loads settings from `MARKET_CONFIG`, falling back to `./config.toml`.
///
/// A missing default file is not an error: the built-in settings are used.
pub fn load_default_settings() -> Result<Settings> {
    if let Ok(path) = std::env::var("MARKET_CONFIG") {
        return load_settings(path);
    }

    if Path::new("config.toml").exists() {
        load_settings("config.toml")
    } else {
        info!("No config.toml found, using built-in settings.");
        Ok(Settings::default())
    }
}
