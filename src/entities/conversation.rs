//! Conversation entity - A direct message thread between two users.
//!
//! Participants are stored in sorted order (`participant_a < participant_b`)
//! and `pair_key` joins them, so the unique index on `pair_key` allows exactly
//! one conversation per unordered pair. Unread counters live next to their
//! participant.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Conversation database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "conversations")]
pub struct Model {
    /// Unique conversation id
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// `"{participant_a}|{participant_b}"`
    #[sea_orm(unique)]
    pub pair_key: String,
    /// Lower participant id
    pub participant_a: String,
    /// Higher participant id
    pub participant_b: String,
    /// Preview of the latest message
    pub last_message: Option<String>,
    /// Time of the latest activity
    pub last_updated_at: DateTimeUtc,
    /// Item the conversation started from
    pub related_item_id: Option<String>,
    /// Name of that item
    pub related_item_name: Option<String>,
    /// Photo of that item
    pub related_item_photo: Option<String>,
    /// Messages `participant_a` has not read
    pub unread_a: i32,
    /// Messages `participant_b` has not read
    pub unread_b: i32,
}

impl Model {
    /// Both participant ids.
    pub fn participant_ids(&self) -> [&str; 2] {
        [&self.participant_a, &self.participant_b]
    }

    /// Whether `user_id` takes part in this conversation.
    pub fn includes(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    /// The participant that is not `user_id`.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if self.participant_a == user_id {
            Some(&self.participant_b)
        } else if self.participant_b == user_id {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    /// Unread messages for `user_id`; 0 for non-participants.
    pub fn unread_for(&self, user_id: &str) -> i32 {
        if self.participant_a == user_id {
            self.unread_a
        } else if self.participant_b == user_id {
            self.unread_b
        } else {
            0
        }
    }

    /// Unread counter per participant.
    pub fn unread_counts(&self) -> HashMap<String, i32> {
        HashMap::from([
            (self.participant_a.clone(), self.unread_a),
            (self.participant_b.clone(), self.unread_b),
        ])
    }
}

/// Defines relationships between Conversation and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One conversation has many messages
    #[sea_orm(has_many = "super::message::Entity")]
    Messages,
}

impl Related<super::message::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Messages.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
