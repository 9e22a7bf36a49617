//! Review entity - A rating and comment left by one user about another.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Review database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reviews")]
pub struct Model {
    /// Unique review id
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Author of the review
    pub reviewer_id: String,
    /// Author's display name at review time
    pub reviewer_name: String,
    /// User being rated
    pub reviewee_id: String,
    /// 1 to 5 stars
    pub rating: i32,
    /// Trimmed comment text
    pub comment: String,
    /// When the review was written
    pub created_at: DateTimeUtc,
    /// Item the trade was about
    pub related_item_id: Option<String>,
}

/// Reviews have no enforced relationships
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
