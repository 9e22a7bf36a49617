//! Notification entity - System messages addressed to one user
//! (listing approved or rejected, system notices).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Event that produced the notification
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum NotificationKind {
    /// A listing was rejected by moderation
    #[sea_orm(string_value = "item_rejected")]
    ItemRejected,
    /// A listing was approved by moderation
    #[sea_orm(string_value = "item_approved")]
    ItemApproved,
    /// New chat activity
    #[sea_orm(string_value = "message")]
    Message,
    /// Anything else
    #[sea_orm(string_value = "system")]
    System,
}

/// Notification database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "notifications")]
pub struct Model {
    /// Unique notification id
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Recipient
    pub user_id: String,
    /// Event type
    pub kind: NotificationKind,
    /// Short headline
    pub title: String,
    /// Full text
    pub body: String,
    /// Whether the user has seen it
    pub read: bool,
    /// When it was created
    pub created_at: DateTimeUtc,
    /// Related listing id
    pub related_item_id: Option<String>,
    /// Related listing name
    pub related_item_name: Option<String>,
    /// Moderation reason, for rejections
    pub related_reason: Option<String>,
    /// Route the UI navigates to when the notification is opened
    pub action_route: Option<String>,
}

/// Notifications have no enforced relationships
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
