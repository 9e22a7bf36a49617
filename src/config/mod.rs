/// Database configuration and connection management
pub mod database;

/// Voucher catalog loading from config.toml
pub mod catalog;

/// Points rules and realtime tuning from config.toml
pub mod settings;

pub use settings::{PointsRules, RealtimeSettings, Settings};
