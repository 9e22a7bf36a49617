//! Conversation business logic - Direct messages between two users.
//!
//! There is exactly one conversation per unordered pair of users. The pair is
//! stored sorted and joined into `pair_key`, which carries a unique index, so
//! [`get_or_create`] is an insert that ignores the conflict followed by a
//! lookup. Concurrent callers for the same pair converge on one row.
//!
//! Sending a message appends it, refreshes the conversation preview and bumps
//! the recipient's unread counter in one transaction. Readers follow changes
//! through [`ConversationsQuery`], [`MessagesQuery`] and [`TotalUnreadQuery`].
//! The conversation list is delivered as [`ConversationSummary`] rows that
//! carry the other participant's name and photo.

use crate::{
    entities::{
        Conversation, Message, User,
        conversation::{self, Column as ConversationColumn},
        message, user,
    },
    errors::{Error, Result},
    realtime::{ChangeFeed, SnapshotQuery, Topic},
};
use chrono::{DateTime, Utc};
use sea_orm::{
    Condition, QueryOrder, Set, TransactionTrait, prelude::*, sea_query::OnConflict,
};
use std::collections::HashMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Longest accepted message body.
pub const MAX_MESSAGE_CHARS: usize = 1000;
const PREVIEW_CHARS: usize = 80;
/// Name shown for a participant whose account no longer exists.
pub const UNKNOWN_USER_NAME: &str = "Unknown user";

/// Item a conversation was started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedItem {
    /// Item id
    pub id: String,
    /// Item name
    pub name: String,
    /// First photo of the item
    pub photo: Option<String>,
}

/// A conversation as listed for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// The stored conversation
    pub conversation: conversation::Model,
    /// The other participant
    pub other_user_id: String,
    /// Display name of the other participant, or [`UNKNOWN_USER_NAME`]
    pub other_user_name: String,
    /// Profile photo of the other participant
    pub other_user_photo: Option<String>,
    /// Messages waiting for the listing participant
    pub unread: i32,
}

/// Sorted participants and the pair key they form.
///
/// The key is prefixed with the byte length of the first id, so ids that
/// contain the separator cannot make two pairs collide.
fn pair_of(first: &str, second: &str) -> (String, String, String) {
    let (a, b) = if first <= second {
        (first, second)
    } else {
        (second, first)
    };
    (a.to_string(), b.to_string(), format!("{}:{a}|{b}", a.len()))
}

fn unread_column(conversation: &conversation::Model, user_id: &str) -> Option<ConversationColumn> {
    if conversation.participant_a == user_id {
        Some(ConversationColumn::UnreadA)
    } else if conversation.participant_b == user_id {
        Some(ConversationColumn::UnreadB)
    } else {
        None
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        return content.to_string();
    }
    let cut: String = content.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}...")
}

fn publish_participants(feed: &ChangeFeed, conversation: &conversation::Model) {
    for participant in conversation.participant_ids() {
        feed.publish(Topic::Conversations(participant.to_string()));
    }
}

/// Finds a conversation by id.
pub async fn find(
    db: &DatabaseConnection,
    conversation_id: &str,
) -> Result<Option<conversation::Model>> {
    Conversation::find_by_id(conversation_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Finds the conversation between two users, in either order.
pub async fn find_between(
    db: &DatabaseConnection,
    first: &str,
    second: &str,
) -> Result<Option<conversation::Model>> {
    let (_, _, pair_key) = pair_of(first, second);
    Conversation::find()
        .filter(ConversationColumn::PairKey.eq(pair_key))
        .one(db)
        .await
        .map_err(Into::into)
}

/// Returns the conversation between `first` and `second`, creating it if needed.
///
/// Both unread counters start at 0. `related_item` is only recorded when the
/// conversation is created.
#[instrument(skip(db, feed, related_item))]
pub async fn get_or_create(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    first: &str,
    second: &str,
    related_item: Option<&RelatedItem>,
    now: DateTime<Utc>,
) -> Result<conversation::Model> {
    if first.is_empty() || second.is_empty() {
        return Err(Error::validation("Both participants are required"));
    }
    if first == second {
        return Err(Error::validation("Cannot start a conversation with yourself"));
    }

    let (participant_a, participant_b, pair_key) = pair_of(first, second);
    let candidate = conversation::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        pair_key: Set(pair_key.clone()),
        participant_a: Set(participant_a),
        participant_b: Set(participant_b),
        last_message: Set(None),
        last_updated_at: Set(now),
        related_item_id: Set(related_item.map(|item| item.id.clone())),
        related_item_name: Set(related_item.map(|item| item.name.clone())),
        related_item_photo: Set(related_item.and_then(|item| item.photo.clone())),
        unread_a: Set(0),
        unread_b: Set(0),
    };
    let inserted = Conversation::insert(candidate)
        .on_conflict(
            OnConflict::column(ConversationColumn::PairKey)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    let conversation = Conversation::find()
        .filter(ConversationColumn::PairKey.eq(pair_key.as_str()))
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("conversation", pair_key))?;

    if inserted > 0 {
        info!(conversation_id = %conversation.id, "Conversation created");
        publish_participants(feed, &conversation);
    }
    Ok(conversation)
}

/// Conversations `user_id` takes part in, most recently active first.
pub async fn conversations_for_user(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<conversation::Model>> {
    Conversation::find()
        .filter(
            Condition::any()
                .add(ConversationColumn::ParticipantA.eq(user_id))
                .add(ConversationColumn::ParticipantB.eq(user_id)),
        )
        .order_by_desc(ConversationColumn::LastUpdatedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Conversations of `user_id` joined with the other participant's profile.
///
/// Same order as [`conversations_for_user`].
pub async fn summaries_for_user(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<ConversationSummary>> {
    let conversations = conversations_for_user(db, user_id).await?;
    let other_ids: Vec<&str> = conversations
        .iter()
        .filter_map(|c| c.other_participant(user_id))
        .collect();
    let others: HashMap<String, user::Model> = User::find()
        .filter(user::Column::Id.is_in(other_ids))
        .all(db)
        .await?
        .into_iter()
        .map(|u| (u.id.clone(), u))
        .collect();

    Ok(conversations
        .into_iter()
        .filter_map(|conversation| {
            let other_user_id = conversation.other_participant(user_id)?.to_string();
            let other = others.get(&other_user_id);
            let other_user_name =
                other.map_or_else(|| UNKNOWN_USER_NAME.to_string(), |u| u.name.clone());
            let other_user_photo = other.and_then(|u| u.photo_url.clone());
            let unread = conversation.unread_for(user_id);
            Some(ConversationSummary {
                conversation,
                other_user_id,
                other_user_name,
                other_user_photo,
                unread,
            })
        })
        .collect())
}

/// Messages of a conversation in chronological order.
pub async fn messages(db: &DatabaseConnection, conversation_id: &str) -> Result<Vec<message::Model>> {
    Message::find()
        .filter(message::Column::ConversationId.eq(conversation_id))
        .order_by_asc(message::Column::Timestamp)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Sends `content` from `sender_id` with a generated message id.
pub async fn send_message(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    conversation_id: &str,
    sender_id: &str,
    content: &str,
    now: DateTime<Utc>,
) -> Result<message::Model> {
    let message_id = Uuid::new_v4().to_string();
    send_message_with_id(db, feed, conversation_id, &message_id, sender_id, content, now).await
}

/// Sends `content` from `sender_id` using a caller-chosen message id.
///
/// The recipient is the other participant. The conversation preview and
/// activity time are refreshed and only the recipient's unread counter grows.
///
/// # Errors
/// * `NotFound` - the conversation does not exist or `sender_id` is not a participant
/// * `Validation` - empty or oversized content
#[instrument(skip(db, feed, content))]
pub async fn send_message_with_id(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    conversation_id: &str,
    message_id: &str,
    sender_id: &str,
    content: &str,
    now: DateTime<Utc>,
) -> Result<message::Model> {
    let content = content.trim();
    if content.is_empty() {
        return Err(Error::validation("Message cannot be empty"));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(Error::validation(format!(
            "Message cannot exceed {MAX_MESSAGE_CHARS} characters"
        )));
    }

    let txn = db.begin().await?;
    let conversation = Conversation::find_by_id(conversation_id)
        .one(&txn)
        .await?
        .filter(|c| c.includes(sender_id))
        .ok_or_else(|| Error::not_found("conversation", conversation_id))?;
    let recipient_id = conversation
        .other_participant(sender_id)
        .map(str::to_string)
        .ok_or_else(|| Error::not_found("conversation", conversation_id))?;
    let recipient_column = unread_column(&conversation, &recipient_id)
        .ok_or_else(|| Error::not_found("conversation", conversation_id))?;

    let message = message::ActiveModel {
        id: Set(message_id.to_string()),
        conversation_id: Set(conversation_id.to_string()),
        sender_id: Set(sender_id.to_string()),
        recipient_id: Set(recipient_id),
        content: Set(content.to_string()),
        timestamp: Set(now),
        read: Set(false),
    };
    let result = message.insert(&txn).await?;

    Conversation::update_many()
        .col_expr(ConversationColumn::LastMessage, Expr::value(Some(preview(content))))
        .col_expr(ConversationColumn::LastUpdatedAt, Expr::value(now))
        .col_expr(recipient_column, Expr::col(recipient_column).add(1))
        .filter(ConversationColumn::Id.eq(conversation_id))
        .exec(&txn)
        .await?;
    txn.commit().await?;

    debug!(conversation_id, "Message sent");
    feed.publish(Topic::Messages(conversation_id.to_string()));
    publish_participants(feed, &conversation);
    Ok(result)
}

/// Resets `user_id`'s unread counter and marks the messages addressed to them as read.
///
/// Idempotent. Returns the number of messages that flipped to read.
pub async fn mark_read(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    conversation_id: &str,
    user_id: &str,
) -> Result<u64> {
    let txn = db.begin().await?;
    let conversation = Conversation::find_by_id(conversation_id)
        .one(&txn)
        .await?
        .ok_or_else(|| Error::not_found("conversation", conversation_id))?;
    let Some(column) = unread_column(&conversation, user_id) else {
        return Err(Error::PermissionDenied {
            message: "Not a participant of this conversation".to_string(),
        });
    };

    let counter_was = conversation.unread_for(user_id);
    if counter_was != 0 {
        Conversation::update_many()
            .col_expr(column, Expr::value(0))
            .filter(ConversationColumn::Id.eq(conversation_id))
            .exec(&txn)
            .await?;
    }
    let flipped = Message::update_many()
        .col_expr(message::Column::Read, Expr::value(true))
        .filter(message::Column::ConversationId.eq(conversation_id))
        .filter(message::Column::RecipientId.eq(user_id))
        .filter(message::Column::Read.eq(false))
        .exec(&txn)
        .await?
        .rows_affected;
    txn.commit().await?;

    if counter_was != 0 || flipped > 0 {
        feed.publish(Topic::Messages(conversation_id.to_string()));
        publish_participants(feed, &conversation);
    }
    Ok(flipped)
}

/// Deletes a conversation and all of its messages.
///
/// Returns false if the conversation did not exist.
#[instrument(skip(db, feed))]
pub async fn delete_conversation(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    conversation_id: &str,
) -> Result<bool> {
    let txn = db.begin().await?;
    let Some(conversation) = Conversation::find_by_id(conversation_id).one(&txn).await? else {
        return Ok(false);
    };

    let removed = Message::delete_many()
        .filter(message::Column::ConversationId.eq(conversation_id))
        .exec(&txn)
        .await?
        .rows_affected;
    Conversation::delete_by_id(conversation_id).exec(&txn).await?;
    txn.commit().await?;

    info!(conversation_id, removed, "Conversation deleted");
    feed.publish(Topic::Messages(conversation_id.to_string()));
    publish_participants(feed, &conversation);
    Ok(true)
}

/// Sum of `user_id`'s unread counters across all conversations.
pub async fn total_unread(db: &DatabaseConnection, user_id: &str) -> Result<i64> {
    let conversations = conversations_for_user(db, user_id).await?;
    Ok(conversations
        .iter()
        .map(|c| i64::from(c.unread_for(user_id)))
        .sum())
}

/// Live conversation list of one user, most recently active first.
///
/// Reloads on conversation activity; profile edits of the other participant
/// show up with the next reload.
pub struct ConversationsQuery;

impl SnapshotQuery for ConversationsQuery {
    type Snapshot = Vec<ConversationSummary>;
    const NAME: &'static str = "conversations";

    fn topic(key: &str) -> Topic {
        Topic::Conversations(key.to_string())
    }

    async fn load(db: &DatabaseConnection, key: &str) -> Result<Self::Snapshot> {
        summaries_for_user(db, key).await
    }
}

/// Live message list of one conversation, oldest first.
pub struct MessagesQuery;

impl SnapshotQuery for MessagesQuery {
    type Snapshot = Vec<message::Model>;
    const NAME: &'static str = "messages";

    fn topic(key: &str) -> Topic {
        Topic::Messages(key.to_string())
    }

    async fn load(db: &DatabaseConnection, key: &str) -> Result<Self::Snapshot> {
        messages(db, key).await
    }
}

/// Live total of a user's unread messages.
pub struct TotalUnreadQuery;

impl SnapshotQuery for TotalUnreadQuery {
    type Snapshot = i64;
    const NAME: &'static str = "total_unread";

    fn topic(key: &str) -> Topic {
        Topic::Conversations(key.to_string())
    }

    async fn load(db: &DatabaseConnection, key: &str) -> Result<Self::Snapshot> {
        total_unread(db, key).await
    }
}
