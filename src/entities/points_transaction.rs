//! Points transaction entity - The append-only ledger.
//!
//! Each row records one balance-changing event with the balance before and
//! after it. Rows are totally ordered per user by their autoincrement `id`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Kind of ledger entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum PointsKind {
    /// Points earned by an action (trade, verification)
    #[sea_orm(string_value = "earned")]
    Earned,
    /// Points spent on a voucher
    #[sea_orm(string_value = "spent")]
    Spent,
    /// Points removed by expiry
    #[sea_orm(string_value = "expired")]
    Expired,
    /// One-off bonus (signup, trade milestone)
    #[sea_orm(string_value = "bonus")]
    Bonus,
}

impl PointsKind {
    /// Signed effect of an entry of this kind on the balance.
    pub const fn signed(self, amount: i64) -> i64 {
        match self {
            Self::Earned | Self::Bonus => amount,
            Self::Spent | Self::Expired => -amount,
        }
    }
}

/// Ledger entry database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "points_transactions")]
pub struct Model {
    /// Position in the global ledger
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Owner of the balance
    pub user_id: String,
    /// Direction of the entry
    pub kind: PointsKind,
    /// Always positive; the kind gives the sign
    pub amount: i64,
    /// Human-readable reason, e.g. `"Trade completed"`
    pub reason: String,
    /// Item that triggered the entry, if any
    pub related_item_id: Option<String>,
    /// Voucher that consumed the points, if any
    pub related_voucher_id: Option<String>,
    /// When the entry was written
    pub timestamp: DateTimeUtc,
    /// Balance before this entry
    pub balance_before: i64,
    /// Balance after this entry
    pub balance_after: i64,
}

/// Defines relationships between the ledger and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each entry belongs to one user
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
