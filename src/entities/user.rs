//! User entity - Registered marketplace members.
//!
//! The `points_balance` column is a denormalized copy of the ledger sum kept
//! for fast reads; every ledger write updates it in the same database
//! transaction. `badges` holds a JSON array of badge ids with set semantics.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Access level of a user
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum Role {
    /// Regular member
    #[sea_orm(string_value = "user")]
    User,
    /// Moderator with catalog and account management rights
    #[sea_orm(string_value = "admin")]
    Admin,
}

/// User database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    /// Identity issued by the authentication provider
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Display name
    pub name: String,
    /// Login email, unique across users
    #[sea_orm(unique)]
    pub email: String,
    /// Contact phone
    pub phone: String,
    /// City shown on listings
    pub city: String,
    /// Approved profile photo URL
    pub photo_url: Option<String>,
    /// Free-form biography
    pub bio: Option<String>,
    /// Average review rating, 0 to 5
    pub rating: f64,
    /// Cached ledger balance
    pub points_balance: i64,
    /// Number of completed trades
    pub trades_completed: i32,
    /// JSON array of badge ids
    pub badges: Json,
    /// Whether the account has been verified
    pub verified: bool,
    /// Access level
    pub role: Role,
    /// Token of the device currently holding the session
    pub session_token: Option<String>,
    /// When the account was created
    pub registered_at: DateTimeUtc,
    /// Last accepted photo change
    pub photo_updated_at: Option<DateTimeUtc>,
    /// Last profile edit
    pub profile_updated_at: DateTimeUtc,
}

impl Model {
    /// Badge ids held by this user.
    pub fn badge_set(&self) -> BTreeSet<String> {
        self.badges
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the user holds the admin role.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Serializes a badge set into the stored JSON form.
pub fn badges_json(badges: &BTreeSet<String>) -> Json {
    Json::Array(badges.iter().cloned().map(Json::String).collect())
}

/// Defines relationships between User and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One user has many ledger entries
    #[sea_orm(has_many = "super::points_transaction::Entity")]
    PointsTransactions,
    /// One user has many redeemed vouchers
    #[sea_orm(has_many = "super::voucher_redemption::Entity")]
    Redemptions,
}

impl Related<super::points_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PointsTransactions.def()
    }
}

impl Related<super::voucher_redemption::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Redemptions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
