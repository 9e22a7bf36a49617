//! Notification business logic - Moderation results and system notices.

use crate::{
    entities::{
        Notification,
        notification::{self, NotificationKind},
    },
    errors::{Error, Result},
    realtime::{ChangeFeed, SnapshotQuery, Topic},
};
use chrono::{DateTime, Utc};
use sea_orm::{PaginatorTrait, QueryOrder, Set, prelude::*};
use tracing::{debug, info};
use uuid::Uuid;

/// Fields of a new notification.
#[derive(Debug, Clone)]
pub struct NewNotification {
    /// Recipient
    pub user_id: String,
    /// Event type
    pub kind: NotificationKind,
    /// Short headline
    pub title: String,
    /// Full text
    pub body: String,
    /// Related item id
    pub related_item_id: Option<String>,
    /// Related item name
    pub related_item_name: Option<String>,
    /// Moderation reason
    pub related_reason: Option<String>,
    /// Screen to open when tapped
    pub action_route: Option<String>,
}

/// Route of an item's detail screen.
pub fn item_route(item_id: &str) -> String {
    format!("/item/{item_id}")
}

/// Stores a notification and announces it to the recipient.
pub async fn create(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    new: NewNotification,
    now: DateTime<Utc>,
) -> Result<notification::Model> {
    let user_id = new.user_id.clone();
    let model = notification::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        user_id: Set(new.user_id),
        kind: Set(new.kind),
        title: Set(new.title),
        body: Set(new.body),
        read: Set(false),
        created_at: Set(now),
        related_item_id: Set(new.related_item_id),
        related_item_name: Set(new.related_item_name),
        related_reason: Set(new.related_reason),
        action_route: Set(new.action_route),
    };
    let result = model.insert(db).await?;

    debug!(user_id = %user_id, kind = ?result.kind, "Notification created");
    feed.publish(Topic::Notifications(user_id));
    Ok(result)
}

/// Tells `user_id` that moderation rejected one of their items.
pub async fn notify_item_rejected(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    item_id: &str,
    item_name: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<notification::Model> {
    create(
        db,
        feed,
        NewNotification {
            user_id: user_id.to_string(),
            kind: NotificationKind::ItemRejected,
            title: "Item rejected".to_string(),
            body: format!("Your item \"{item_name}\" was rejected by an administrator."),
            related_item_id: Some(item_id.to_string()),
            related_item_name: Some(item_name.to_string()),
            related_reason: Some(reason.to_string()),
            action_route: None,
        },
        now,
    )
    .await
}

/// Tells `user_id` that one of their items is now public.
pub async fn notify_item_approved(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    item_id: &str,
    item_name: &str,
    now: DateTime<Utc>,
) -> Result<notification::Model> {
    create(
        db,
        feed,
        NewNotification {
            user_id: user_id.to_string(),
            kind: NotificationKind::ItemApproved,
            title: "Item approved".to_string(),
            body: format!("Congratulations! Your item \"{item_name}\" is now visible to everyone."),
            related_item_id: Some(item_id.to_string()),
            related_item_name: Some(item_name.to_string()),
            related_reason: None,
            action_route: Some(item_route(item_id)),
        },
        now,
    )
    .await
}

/// Notifications of `user_id`, newest first.
pub async fn list_for_user(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<notification::Model>> {
    Notification::find()
        .filter(notification::Column::UserId.eq(user_id))
        .order_by_desc(notification::Column::CreatedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Number of unread notifications of `user_id`.
pub async fn unread_count(db: &DatabaseConnection, user_id: &str) -> Result<u64> {
    Notification::find()
        .filter(notification::Column::UserId.eq(user_id))
        .filter(notification::Column::Read.eq(false))
        .count(db)
        .await
        .map_err(Into::into)
}

async fn owned(
    db: &DatabaseConnection,
    user_id: &str,
    notification_id: &str,
) -> Result<notification::Model> {
    Notification::find_by_id(notification_id)
        .one(db)
        .await?
        .filter(|n| n.user_id == user_id)
        .ok_or_else(|| Error::not_found("notification", notification_id))
}

/// Marks one of `user_id`'s notifications as read.
pub async fn mark_read(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    notification_id: &str,
) -> Result<()> {
    let found = owned(db, user_id, notification_id).await?;
    if found.read {
        return Ok(());
    }
    let mut active: notification::ActiveModel = found.into();
    active.read = Set(true);
    active.update(db).await?;
    feed.publish(Topic::Notifications(user_id.to_string()));
    Ok(())
}

/// Marks every notification of `user_id` as read. Returns how many changed.
pub async fn mark_all_read(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
) -> Result<u64> {
    let result = Notification::update_many()
        .col_expr(notification::Column::Read, Expr::value(true))
        .filter(notification::Column::UserId.eq(user_id))
        .filter(notification::Column::Read.eq(false))
        .exec(db)
        .await?;
    if result.rows_affected > 0 {
        feed.publish(Topic::Notifications(user_id.to_string()));
    }
    Ok(result.rows_affected)
}

/// Deletes one of `user_id`'s notifications.
pub async fn delete(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    notification_id: &str,
) -> Result<()> {
    owned(db, user_id, notification_id).await?;
    Notification::delete_by_id(notification_id).exec(db).await?;
    feed.publish(Topic::Notifications(user_id.to_string()));
    Ok(())
}

/// Deletes every read notification of `user_id`. Returns how many were removed.
pub async fn delete_all_read(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
) -> Result<u64> {
    let result = Notification::delete_many()
        .filter(notification::Column::UserId.eq(user_id))
        .filter(notification::Column::Read.eq(true))
        .exec(db)
        .await?;
    if result.rows_affected > 0 {
        info!(user_id, removed = result.rows_affected, "Read notifications cleared");
        feed.publish(Topic::Notifications(user_id.to_string()));
    }
    Ok(result.rows_affected)
}

/// Live notification list of one user.
pub struct NotificationsQuery;

impl SnapshotQuery for NotificationsQuery {
    type Snapshot = Vec<notification::Model>;
    const NAME: &'static str = "notifications";

    fn topic(key: &str) -> Topic {
        Topic::Notifications(key.to_string())
    }

    async fn load(db: &DatabaseConnection, key: &str) -> Result<Self::Snapshot> {
        list_for_user(db, key).await
    }
}

/// Live unread-notification count of one user.
pub struct UnreadNotificationsQuery;

impl SnapshotQuery for UnreadNotificationsQuery {
    type Snapshot = u64;
    const NAME: &'static str = "unread_notifications";

    fn topic(key: &str) -> Topic {
        Topic::Notifications(key.to_string())
    }

    async fn load(db: &DatabaseConnection, key: &str) -> Result<Self::Snapshot> {
        unread_count(db, key).await
    }
}
