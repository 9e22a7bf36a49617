//! Message entity - A single chat message. Immutable except for `read`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Message database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "messages")]
pub struct Model {
    /// Unique message id, may be chosen by the sending client
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Conversation the message belongs to
    pub conversation_id: String,
    /// Author
    pub sender_id: String,
    /// The other participant
    pub recipient_id: String,
    /// Message text
    pub content: String,
    /// When the message was sent
    pub timestamp: DateTimeUtc,
    /// Whether the recipient has read it
    pub read: bool,
}

/// Defines relationships between Message and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each message belongs to one conversation
    #[sea_orm(
        belongs_to = "super::conversation::Entity",
        from = "Column::ConversationId",
        to = "super::conversation::Column::Id"
    )]
    Conversation,
}

impl Related<super::conversation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Conversation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
