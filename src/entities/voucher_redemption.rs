//! Redeemed voucher entity - A user's claimed reward.
//!
//! `voucher_snapshot` keeps a JSON copy of the catalog entry as it was at
//! redemption time so later catalog edits do not rewrite history.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Redemption database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vouchers_redeemed")]
pub struct Model {
    /// Unique redemption id
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Catalog id of the redeemed voucher
    pub voucher_id: String,
    /// Catalog entry at redemption time
    pub voucher_snapshot: Json,
    /// Owner of the redemption
    pub user_id: String,
    /// When the voucher was claimed
    pub redeemed_at: DateTimeUtc,
    /// End of validity, if the voucher has a duration
    pub expires_at: Option<DateTimeUtc>,
    /// Whether the benefit has been applied
    pub used: bool,
    /// When the benefit was applied
    pub used_at: Option<DateTimeUtc>,
    /// 8-character code from `A-Z0-9`
    #[sea_orm(unique)]
    pub code: String,
    /// Item the benefit was applied to
    pub applied_item_id: Option<String>,
}

impl Model {
    /// Not used and not past its expiry at `now`.
    pub fn is_active_at(&self, now: DateTimeUtc) -> bool {
        !self.used && self.expires_at.is_none_or(|expires| expires > now)
    }
}

/// Defines relationships between redemptions and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each redemption belongs to one user
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
    /// Each redemption refers to one catalog entry
    #[sea_orm(
        belongs_to = "super::voucher::Entity",
        from = "Column::VoucherId",
        to = "super::voucher::Column::Id"
    )]
    Voucher,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::voucher::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Voucher.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
