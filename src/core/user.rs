//! User business logic - registration, profile edits, badges and account removal.
//!
//! Profile edits publish [`Topic::User`] so the session's live user record and
//! every balance stream pick them up.

use crate::{
    entities::{
        Conversation, Message, Notification, PointsTransaction, Review, User, VoucherRedemption,
        conversation, message, notification, points_transaction, review,
        user::{self, Role, badges_json},
        voucher_redemption,
    },
    errors::{Error, Result},
    realtime::{ChangeFeed, SnapshotQuery, Topic},
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::{Condition, Set, TransactionTrait, prelude::*};
use tracing::{info, instrument, warn};

/// Days between two accepted profile photo changes.
pub const PHOTO_COOLDOWN_DAYS: i64 = 30;
/// Shortest accepted display name.
pub const MIN_NAME_CHARS: usize = 3;
/// Longest accepted biography.
pub const MAX_BIO_CHARS: usize = 200;

/// Badge ids granted by the marketplace.
pub mod badges {
    /// First completed trade
    pub const FIRST_TRADE: &str = "first-trade";
    /// Verified account
    pub const VERIFIED: &str = "verified";
    /// 10 completed trades
    pub const TRADER: &str = "trader";
    /// 25 completed trades
    pub const COLLECTOR: &str = "collector";
    /// 50 completed trades
    pub const EXPERT: &str = "expert";

    /// Badge earned on reaching `trades` completed trades, if any.
    pub const fn for_trade_count(trades: i32) -> Option<&'static str> {
        match trades {
            1 => Some(FIRST_TRADE),
            10 => Some(TRADER),
            25 => Some(COLLECTOR),
            50 => Some(EXPERT),
            _ => None,
        }
    }
}

/// Data collected by the sign-up form.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Display name
    pub name: String,
    /// Login email
    pub email: String,
    /// Contact phone
    pub phone: String,
    /// City
    pub city: String,
}

/// Editable profile fields.
#[derive(Debug, Clone)]
pub struct ProfileUpdate {
    /// Display name
    pub name: String,
    /// Contact phone
    pub phone: String,
    /// City
    pub city: String,
    /// Biography, `None` clears it
    pub bio: Option<String>,
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.chars().count() < MIN_NAME_CHARS {
        return Err(Error::validation(format!(
            "Name must have at least {MIN_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

/// Finds a user by id.
pub async fn get_user<C>(db: &C, user_id: &str) -> Result<Option<user::Model>>
where
    C: ConnectionTrait,
{
    User::find_by_id(user_id).one(db).await.map_err(Into::into)
}

/// Finds a user by id, failing with `NotFound` when it does not exist.
pub async fn require_user<C>(db: &C, user_id: &str) -> Result<user::Model>
where
    C: ConnectionTrait,
{
    get_user(db, user_id)
        .await?
        .ok_or_else(|| Error::not_found("user", user_id))
}

/// Creates the user record for an identity issued by the authentication provider.
///
/// The name must have at least three characters and the email must look like
/// an address and not be registered yet.
#[instrument(skip(db, feed, form), fields(email = %form.email))]
pub async fn register(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    form: &Registration,
    now: DateTime<Utc>,
) -> Result<user::Model> {
    let name = validate_name(&form.name)?;
    let email = form.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(Error::validation("Email address is not valid"));
    }

    if get_user(db, user_id).await?.is_some() {
        return Err(Error::validation("This account is already registered"));
    }
    let email_taken = User::find()
        .filter(user::Column::Email.eq(email.as_str()))
        .one(db)
        .await?;
    if email_taken.is_some() {
        return Err(Error::validation("Email is already registered"));
    }

    let user = user::ActiveModel {
        id: Set(user_id.to_string()),
        name: Set(name),
        email: Set(email),
        phone: Set(form.phone.trim().to_string()),
        city: Set(form.city.trim().to_string()),
        photo_url: Set(None),
        bio: Set(None),
        rating: Set(5.0),
        points_balance: Set(0),
        trades_completed: Set(0),
        badges: Set(Json::Array(Vec::new())),
        verified: Set(false),
        role: Set(Role::User),
        session_token: Set(None),
        registered_at: Set(now),
        photo_updated_at: Set(None),
        profile_updated_at: Set(now),
    };
    let result = user.insert(db).await?;

    info!(user_id, "User registered");
    feed.publish(Topic::User(user_id.to_string()));
    Ok(result)
}

/// Updates name, phone, city and biography.
pub async fn update_profile(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    update: &ProfileUpdate,
    now: DateTime<Utc>,
) -> Result<user::Model> {
    let name = validate_name(&update.name)?;
    let bio = update
        .bio
        .as_deref()
        .map(str::trim)
        .filter(|bio| !bio.is_empty());
    if bio.is_some_and(|bio| bio.chars().count() > MAX_BIO_CHARS) {
        return Err(Error::validation(format!(
            "Biography cannot exceed {MAX_BIO_CHARS} characters"
        )));
    }

    let mut active: user::ActiveModel = require_user(db, user_id).await?.into();
    active.name = Set(name);
    active.phone = Set(update.phone.trim().to_string());
    active.city = Set(update.city.trim().to_string());
    active.bio = Set(bio.map(str::to_string));
    active.profile_updated_at = Set(now);
    let result = active.update(db).await?;

    feed.publish(Topic::User(user_id.to_string()));
    Ok(result)
}

/// Whole days left before `user` may change the profile photo again; 0 when allowed.
pub fn days_until_photo_change(user: &user::Model, now: DateTime<Utc>) -> i64 {
    let Some(last) = user.photo_updated_at else {
        return 0;
    };
    let remaining = Duration::days(PHOTO_COOLDOWN_DAYS) - (now - last);
    if remaining <= Duration::zero() {
        return 0;
    }
    // Round partial days up.
    let seconds = remaining.num_seconds();
    (seconds + 86_399) / 86_400
}

/// Replaces the profile photo, at most once every [`PHOTO_COOLDOWN_DAYS`] days.
pub async fn update_photo(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    photo_url: &str,
    now: DateTime<Utc>,
) -> Result<user::Model> {
    if photo_url.trim().is_empty() {
        return Err(Error::validation("Photo URL cannot be empty"));
    }

    let user = require_user(db, user_id).await?;
    let wait = days_until_photo_change(&user, now);
    if wait > 0 {
        return Err(Error::AlreadyProcessed {
            message: format!("You must wait {wait} days to change your photo"),
        });
    }

    let mut active: user::ActiveModel = user.into();
    active.photo_url = Set(Some(photo_url.trim().to_string()));
    active.photo_updated_at = Set(Some(now));
    let result = active.update(db).await?;

    feed.publish(Topic::User(user_id.to_string()));
    Ok(result)
}

/// Adds `badge` to the user's set. Returns false if it was already held.
pub async fn add_badge<C>(db: &C, user_id: &str, badge: &str) -> Result<bool>
where
    C: ConnectionTrait,
{
    let user = require_user(db, user_id).await?;
    let mut badges = user.badge_set();
    if !badges.insert(badge.to_string()) {
        return Ok(false);
    }

    let mut active: user::ActiveModel = user.into();
    active.badges = Set(badges_json(&badges));
    active.update(db).await?;
    info!(user_id, badge, "Badge granted");
    Ok(true)
}

/// Stores the recalculated average review rating.
pub async fn set_rating<C>(db: &C, user_id: &str, rating: f64) -> Result<()>
where
    C: ConnectionTrait,
{
    User::update_many()
        .col_expr(user::Column::Rating, Expr::value(rating.clamp(0.0, 5.0)))
        .filter(user::Column::Id.eq(user_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Records `token` as the device currently holding the user's session.
pub async fn set_session_token(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    token: &str,
) -> Result<()> {
    let result = User::update_many()
        .col_expr(user::Column::SessionToken, Expr::value(token))
        .filter(user::Column::Id.eq(user_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(Error::not_found("user", user_id));
    }
    feed.publish(Topic::User(user_id.to_string()));
    Ok(())
}

/// Clears the stored session token, but only while it still equals `token`.
///
/// Returns false when another device has taken over the session.
pub async fn clear_session_token(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    token: &str,
) -> Result<bool> {
    let result = User::update_many()
        .col_expr(user::Column::SessionToken, Expr::value(Option::<String>::None))
        .filter(user::Column::Id.eq(user_id))
        .filter(user::Column::SessionToken.eq(token))
        .exec(db)
        .await?;
    if result.rows_affected > 0 {
        feed.publish(Topic::User(user_id.to_string()));
    }
    Ok(result.rows_affected > 0)
}

/// Deletes `target_id` and everything it owns. Admins only.
///
/// Removes, in order: messages and conversations the user takes part in,
/// ledger entries, redemptions, notifications, reviews written or received,
/// and finally the user record.
#[instrument(skip(db, feed, acting), fields(acting = %acting.id))]
pub async fn delete_account(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    acting: &user::Model,
    target_id: &str,
) -> Result<()> {
    if !acting.is_admin() {
        warn!(target_id, "Account deletion refused for non-admin");
        return Err(Error::PermissionDenied {
            message: "Only administrators can delete accounts".to_string(),
        });
    }

    let txn = db.begin().await?;
    require_user(&txn, target_id).await?;

    let conversations = Conversation::find()
        .filter(
            Condition::any()
                .add(conversation::Column::ParticipantA.eq(target_id))
                .add(conversation::Column::ParticipantB.eq(target_id)),
        )
        .all(&txn)
        .await?;
    let conversation_ids: Vec<String> = conversations.iter().map(|c| c.id.clone()).collect();

    Message::delete_many()
        .filter(message::Column::ConversationId.is_in(conversation_ids.clone()))
        .exec(&txn)
        .await?;
    Conversation::delete_many()
        .filter(conversation::Column::Id.is_in(conversation_ids))
        .exec(&txn)
        .await?;
    PointsTransaction::delete_many()
        .filter(points_transaction::Column::UserId.eq(target_id))
        .exec(&txn)
        .await?;
    VoucherRedemption::delete_many()
        .filter(voucher_redemption::Column::UserId.eq(target_id))
        .exec(&txn)
        .await?;
    Notification::delete_many()
        .filter(notification::Column::UserId.eq(target_id))
        .exec(&txn)
        .await?;
    Review::delete_many()
        .filter(
            Condition::any()
                .add(review::Column::ReviewerId.eq(target_id))
                .add(review::Column::RevieweeId.eq(target_id)),
        )
        .exec(&txn)
        .await?;
    User::delete_by_id(target_id).exec(&txn).await?;

    txn.commit().await?;
    info!(target_id, "Account deleted");

    feed.publish(Topic::User(target_id.to_string()));
    feed.publish(Topic::Notifications(target_id.to_string()));
    for conversation in &conversations {
        feed.publish(Topic::Messages(conversation.id.clone()));
        for participant in conversation.participant_ids() {
            feed.publish(Topic::Conversations(participant.to_string()));
        }
    }
    Ok(())
}

/// Live view of one user record, `None` once the user is gone.
pub struct UserRecordQuery;

impl SnapshotQuery for UserRecordQuery {
    type Snapshot = Option<user::Model>;
    const NAME: &'static str = "user_record";

    fn topic(key: &str) -> Topic {
        Topic::User(key.to_string())
    }

    async fn load(db: &DatabaseConnection, key: &str) -> Result<Self::Snapshot> {
        get_user(db, key).await
    }
}
