//! Voucher entity - The reward catalog.
//!
//! Catalog entries are seeded from configuration. `stock = None` means the
//! voucher is unlimited; bounded stock is decremented on every redemption.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// What a voucher grants
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum VoucherKind {
    /// Listing shown first in searches
    #[sea_orm(string_value = "highlight")]
    Highlight,
    /// Extended listing features
    #[sea_orm(string_value = "premium")]
    Premium,
    /// External benefit (gift card, cashback)
    #[sea_orm(string_value = "benefit")]
    Benefit,
    /// Profile badge
    #[sea_orm(string_value = "badge")]
    Badge,
}

/// Catalog entry database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vouchers")]
pub struct Model {
    /// Stable catalog id, e.g. `"highlight-7d"`
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Display name
    pub name: String,
    /// What the user gets
    pub description: String,
    /// Price in points
    pub points_required: i64,
    /// Benefit category
    pub kind: VoucherKind,
    /// Whether the voucher can currently be redeemed
    pub active: bool,
    /// Remaining units, `None` for unlimited
    pub stock: Option<i32>,
    /// Validity after redemption in days, `None` for no expiry
    pub duration_days: Option<i32>,
}

/// Defines relationships between Voucher and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One voucher has many redemptions
    #[sea_orm(has_many = "super::voucher_redemption::Entity")]
    Redemptions,
}

impl Related<super::voucher_redemption::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Redemptions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
