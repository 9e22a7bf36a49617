//! Voucher catalog configuration
//!
//! The catalog is static data: it is defined in config.toml (or the built-in
//! list below) and written to the `vouchers` table at startup. Only stock
//! changes at runtime.

use crate::entities::voucher::{self, VoucherKind};
use serde::Deserialize;

/// Configuration for a single catalog entry
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct VoucherConfig {
    /// Stable catalog id
    pub id: String,
    /// Display name
    pub name: String,
    /// What the user gets
    pub description: String,
    /// Price in points
    pub points_required: i64,
    /// Benefit category
    pub kind: VoucherKind,
    /// Whether the voucher can be redeemed
    #[serde(default = "default_active")]
    pub active: bool,
    /// Units available, absent for unlimited
    #[serde(default)]
    pub stock: Option<i32>,
    /// Validity in days, absent for no expiry
    #[serde(default)]
    pub duration_days: Option<i32>,
}

const fn default_active() -> bool {
    true
}

impl VoucherConfig {
    fn new(
        id: &str,
        name: &str,
        description: &str,
        points_required: i64,
        kind: VoucherKind,
        stock: Option<i32>,
        duration_days: Option<i32>,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            points_required,
            kind,
            active: true,
            stock,
            duration_days,
        }
    }

    /// The catalog row this entry describes.
    pub fn to_model(&self) -> voucher::Model {
        voucher::Model {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            points_required: self.points_required,
            kind: self.kind,
            active: self.active,
            stock: self.stock,
            duration_days: self.duration_days,
        }
    }
}

/// The catalog the marketplace ships with.
pub fn default_catalog() -> Vec<VoucherConfig> {
    vec![
        VoucherConfig::new(
            "highlight-7d",
            "Highlight listing",
            "Your item shows first in searches for 7 days",
            100,
            VoucherKind::Highlight,
            None,
            Some(7),
        ),
        VoucherConfig::new(
            "premium-10-photos",
            "Premium listing",
            "Publish up to 10 photos on a single item",
            50,
            VoucherKind::Premium,
            None,
            None,
        ),
        VoucherConfig::new(
            "premium-badge-30d",
            "Premium badge",
            "A \"Premium member\" badge on your profile for 30 days",
            500,
            VoucherKind::Badge,
            None,
            Some(30),
        ),
        VoucherConfig::new(
            "amazon-5usd",
            "Amazon gift card $5",
            "Digital Amazon gift card worth 5 USD",
            5000,
            VoucherKind::Benefit,
            Some(10),
            None,
        ),
        VoucherConfig::new(
            "amazon-10usd",
            "Amazon gift card $10",
            "Digital Amazon gift card worth 10 USD",
            9500,
            VoucherKind::Benefit,
            Some(5),
            None,
        ),
        VoucherConfig::new(
            "aliexpress-5usd",
            "AliExpress coupon $5",
            "5 USD off AliExpress orders over 10 USD",
            4500,
            VoucherKind::Benefit,
            Some(8),
            Some(90),
        ),
        VoucherConfig::new(
            "steam-10usd",
            "Steam gift card $10",
            "Steam wallet code worth 10 USD",
            9500,
            VoucherKind::Benefit,
            Some(3),
            None,
        ),
        VoucherConfig::new(
            "googleplay-5usd",
            "Google Play $5",
            "Google Play credit worth 5 USD",
            5000,
            VoucherKind::Benefit,
            Some(6),
            None,
        ),
        VoucherConfig::new(
            "netflix-basic-1m",
            "Netflix Basic 1 month",
            "One month of the Netflix basic plan",
            8000,
            VoucherKind::Benefit,
            Some(2),
            Some(30),
        ),
        VoucherConfig::new(
            "spotify-premium-1m",
            "Spotify Premium 1 month",
            "One month of Spotify Premium",
            7000,
            VoucherKind::Benefit,
            Some(4),
            Some(30),
        ),
        VoucherConfig::new(
            "cashback-10usd",
            "Cash out $10",
            "10 USD to PayPal or bank transfer, processed in 24-48h",
            10000,
            VoucherKind::Benefit,
            None,
            None,
        ),
        VoucherConfig::new(
            "cashback-20usd",
            "Cash out $20",
            "20 USD to PayPal or bank transfer, processed in 24-48h",
            19000,
            VoucherKind::Benefit,
            None,
            None,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_catalog_ids_are_unique() {
        let catalog = default_catalog();
        let ids: HashSet<&str> = catalog.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids.len(), catalog.len());
        assert!(catalog.iter().all(|v| v.points_required > 0));
    }
}
