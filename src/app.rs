//! Client layer handed to the UI.
//!
//! [`AppContext`] is the shared backend: one database, one change feed, the
//! loaded settings and a clock. Every device gets its own [`Client`], which
//! owns a [`Session`] and the live subscriptions it opened. Client methods
//! resolve the acting user from the session, so they fail with
//! `NoActiveSession` while signed out. Form-style actions return an
//! [`Outcome`] instead of an error.

use crate::{
    config::{Settings, database},
    core::{
        conversation::{
            self, ConversationSummary, ConversationsQuery, MessagesQuery, RelatedItem,
            TotalUnreadQuery,
        },
        notification::{self, NotificationsQuery, UnreadNotificationsQuery},
        points::{self, BalanceQuery, PointsStats},
        review,
        session::{DualSessionEvent, Session},
        staged::{Entry, StagedList},
        user::{self, ProfileUpdate, Registration},
        voucher,
    },
    entities::{
        ConversationModel, MessageModel, NotificationModel, PointsTransactionModel, ReviewModel,
        UserModel, VoucherModel, VoucherRedemptionModel,
    },
    errors::{Error, Outcome, Result},
    realtime::{ChangeFeed, Subscription, SubscriptionManager},
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::DatabaseConnection;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use uuid::Uuid;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Jumps to `instant`.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Backend shared by every client.
#[derive(Clone)]
pub struct AppContext {
    /// Database connection for all operations
    pub database: DatabaseConnection,
    /// Change notifications for live views
    pub feed: ChangeFeed,
    /// Loaded configuration
    pub settings: Arc<Settings>,
    /// Time source for expiry and cooldowns
    pub clock: Arc<dyn Clock>,
}

impl AppContext {
    /// Creates a context with the system clock.
    pub fn new(database: DatabaseConnection, settings: Settings) -> Self {
        Self {
            database,
            feed: ChangeFeed::new(),
            settings: Arc::new(settings),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Creates missing tables and seeds the voucher catalog.
    pub async fn prepare(&self) -> Result<()> {
        database::create_tables(&self.database).await?;
        voucher::seed_catalog(&self.database, &self.settings.vouchers).await?;
        Ok(())
    }

    /// A new signed-out client, e.g. one device.
    pub fn client(&self) -> Client {
        Client::new(self.clone())
    }
}

/// The live views one client has open.
struct Realtime {
    conversations: SubscriptionManager<ConversationsQuery>,
    messages: SubscriptionManager<MessagesQuery>,
    total_unread: SubscriptionManager<TotalUnreadQuery>,
    balance: SubscriptionManager<BalanceQuery>,
    notifications: SubscriptionManager<NotificationsQuery>,
    unread_notifications: SubscriptionManager<UnreadNotificationsQuery>,
}

impl Realtime {
    fn new(ctx: &AppContext) -> Self {
        let retry = ctx.settings.realtime.retry_delay();
        let db = &ctx.database;
        let feed = &ctx.feed;
        Self {
            conversations: SubscriptionManager::new(db.clone(), feed.clone(), retry),
            messages: SubscriptionManager::new(db.clone(), feed.clone(), retry),
            total_unread: SubscriptionManager::new(db.clone(), feed.clone(), retry),
            balance: SubscriptionManager::new(db.clone(), feed.clone(), retry),
            notifications: SubscriptionManager::new(db.clone(), feed.clone(), retry),
            unread_notifications: SubscriptionManager::new(db.clone(), feed.clone(), retry),
        }
    }

    fn active_listeners(&self) -> usize {
        self.conversations.active_listeners()
            + self.messages.active_listeners()
            + self.total_unread.active_listeners()
            + self.balance.active_listeners()
            + self.notifications.active_listeners()
            + self.unread_notifications.active_listeners()
    }

    fn shutdown(&self) {
        self.conversations.close_all();
        self.messages.close_all();
        self.total_unread.close_all();
        self.balance.close_all();
        self.notifications.close_all();
        self.unread_notifications.close_all();
    }
}

/// One device's view of the marketplace.
pub struct Client {
    ctx: AppContext,
    session: Session,
    realtime: Realtime,
}

impl Client {
    /// Creates a signed-out client.
    pub fn new(ctx: AppContext) -> Self {
        let session = Session::new(
            ctx.database.clone(),
            ctx.feed.clone(),
            ctx.settings.realtime.retry_delay(),
        );
        let realtime = Realtime::new(&ctx);
        Self {
            ctx,
            session,
            realtime,
        }
    }

    fn db(&self) -> &DatabaseConnection {
        &self.ctx.database
    }

    fn feed(&self) -> &ChangeFeed {
        &self.ctx.feed
    }

    fn acting_id(&self) -> Result<String> {
        self.session.require_user().map(|u| u.id)
    }

    fn require_admin(&self) -> Result<UserModel> {
        let acting = self.session.require_user()?;
        if !acting.is_admin() {
            return Err(Error::PermissionDenied {
                message: "Administrator role required".to_string(),
            });
        }
        Ok(acting)
    }

    /// The session of this client.
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Number of live listeners this client keeps open, session listener excluded.
    pub fn active_listeners(&self) -> usize {
        self.realtime.active_listeners()
    }

    // ---- session ----

    /// Creates the account for an identity issued by the auth provider and signs in.
    ///
    /// The welcome bonus is granted once.
    pub async fn sign_up(&self, user_id: &str, form: &Registration) -> Result<UserModel> {
        let now = self.ctx.clock.now();
        user::register(self.db(), self.feed(), user_id, form, now).await?;
        points::grant_signup_bonus(self.db(), self.feed(), &self.ctx.settings.points, user_id, now)
            .await?;
        self.sign_in(user_id).await
    }

    /// Signs in an identity already verified by the auth provider.
    ///
    /// Views opened for a previous user are torn down first.
    pub async fn sign_in(&self, user_id: &str) -> Result<UserModel> {
        self.realtime.shutdown();
        self.session.sign_in(user_id).await
    }

    /// Signs out and closes every live view of this client.
    pub async fn sign_out(&self) -> Result<()> {
        self.realtime.shutdown();
        self.session.sign_out().await
    }

    /// Live signed-in user.
    pub fn current_user_stream(&self) -> watch::Receiver<Option<UserModel>> {
        self.session.current_user_stream()
    }

    /// Dual-session notifications for this client.
    pub fn dual_session_events(&self) -> broadcast::Receiver<DualSessionEvent> {
        self.session.dual_session_events()
    }

    // ---- profile ----

    /// Edits the signed-in user's profile.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Outcome<UserModel> {
        let result = async {
            let user_id = self.acting_id()?;
            let now = self.ctx.clock.now();
            user::update_profile(self.db(), self.feed(), &user_id, update, now).await
        };
        Outcome::from_result(result.await, "Profile updated")
    }

    /// Replaces the signed-in user's photo, subject to the cooldown.
    pub async fn update_photo(&self, photo_url: &str) -> Outcome<UserModel> {
        let result = async {
            let user_id = self.acting_id()?;
            let now = self.ctx.clock.now();
            user::update_photo(self.db(), self.feed(), &user_id, photo_url, now).await
        };
        Outcome::from_result(result.await, "Photo updated")
    }

    /// Days before the signed-in user may change the photo again.
    pub fn days_until_photo_change(&self) -> Result<i64> {
        let user = self.session.require_user()?;
        Ok(user::days_until_photo_change(&user, self.ctx.clock.now()))
    }

    /// Verifies the signed-in user's account and pays the verification reward.
    pub async fn verify_account(&self) -> Outcome<i64> {
        let result = async {
            let user_id = self.acting_id()?;
            let now = self.ctx.clock.now();
            points::verify_account(self.db(), self.feed(), &self.ctx.settings.points, &user_id, now)
                .await
        };
        Outcome::from_result(result.await, "Account verified")
    }

    // ---- points ----

    /// Cached balance of the signed-in user.
    pub async fn balance(&self) -> Result<i64> {
        points::balance(self.db(), &self.acting_id()?).await
    }

    /// Ledger of the signed-in user, newest first.
    pub async fn points_history(&self) -> Result<Vec<PointsTransactionModel>> {
        points::history(self.db(), &self.acting_id()?).await
    }

    /// Totals for the rewards screen.
    pub async fn points_stats(&self) -> Result<PointsStats> {
        points::stats(self.db(), &self.acting_id()?).await
    }

    /// Rewards the signed-in user for completing a trade of `item_id`.
    pub async fn complete_trade(&self, item_id: &str) -> Result<i64> {
        let user_id = self.acting_id()?;
        points::award_for_completed_trade(
            self.db(),
            self.feed(),
            &self.ctx.settings.points,
            &user_id,
            item_id,
            self.ctx.clock.now(),
        )
        .await
    }

    /// Live balance of the signed-in user.
    pub fn subscribe_balance(&self) -> Result<Subscription<Option<i64>>> {
        Ok(self.realtime.balance.subscribe(&self.acting_id()?))
    }

    // ---- vouchers ----

    /// Vouchers that can be redeemed now.
    pub async fn available_vouchers(&self) -> Result<Vec<VoucherModel>> {
        voucher::list_available(self.db()).await
    }

    /// Redeems a voucher for the signed-in user.
    pub async fn redeem(&self, voucher_id: &str) -> Outcome<VoucherRedemptionModel> {
        let result = async {
            let user_id = self.acting_id()?;
            let now = self.ctx.clock.now();
            voucher::redeem(self.db(), self.feed(), &user_id, voucher_id, now).await
        };
        Outcome::from_result(result.await, "Voucher redeemed")
    }

    /// Marks one of the signed-in user's redemptions as used.
    pub async fn mark_voucher_used(
        &self,
        redemption_id: &str,
        applied_item_id: Option<&str>,
    ) -> Result<bool> {
        let acting = self.session.require_user()?;
        let Some(redemption) = voucher::find_redemption(self.db(), redemption_id).await? else {
            return Ok(false);
        };
        if redemption.user_id != acting.id && !acting.is_admin() {
            return Err(Error::PermissionDenied {
                message: "This voucher belongs to another user".to_string(),
            });
        }
        let now = self.ctx.clock.now();
        voucher::mark_used(self.db(), self.feed(), redemption_id, applied_item_id, now).await
    }

    /// Unused, unexpired redemptions of the signed-in user.
    pub async fn active_redemptions(&self) -> Result<Vec<VoucherRedemptionModel>> {
        let user_id = self.acting_id()?;
        voucher::active_redemptions(self.db(), &user_id, self.ctx.clock.now()).await
    }

    /// Every redemption of the signed-in user.
    pub async fn redemptions(&self) -> Result<Vec<VoucherRedemptionModel>> {
        voucher::redemptions_for_user(self.db(), &self.acting_id()?).await
    }

    // ---- messaging ----

    /// Opens (or creates) the conversation with `other_user_id`.
    pub async fn open_conversation(
        &self,
        other_user_id: &str,
        related_item: Option<&RelatedItem>,
    ) -> Result<ConversationModel> {
        let user_id = self.acting_id()?;
        let now = self.ctx.clock.now();
        conversation::get_or_create(
            self.db(),
            self.feed(),
            &user_id,
            other_user_id,
            related_item,
            now,
        )
        .await
    }

    async fn participating(&self, conversation_id: &str) -> Result<ConversationModel> {
        let user_id = self.acting_id()?;
        conversation::find(self.db(), conversation_id)
            .await?
            .filter(|c| c.includes(&user_id))
            .ok_or_else(|| Error::not_found("conversation", conversation_id))
    }

    /// Sends a message as the signed-in user.
    pub async fn send_message(&self, conversation_id: &str, content: &str) -> Result<MessageModel> {
        let user_id = self.acting_id()?;
        let now = self.ctx.clock.now();
        conversation::send_message(self.db(), self.feed(), conversation_id, &user_id, content, now)
            .await
    }

    /// Marks a conversation read for the signed-in user.
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<u64> {
        let user_id = self.acting_id()?;
        conversation::mark_read(self.db(), self.feed(), conversation_id, &user_id).await
    }

    /// Deletes a conversation the signed-in user takes part in, and its listener.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        if !self.session.is_admin() {
            self.participating(conversation_id).await?;
        }
        let deleted =
            conversation::delete_conversation(self.db(), self.feed(), conversation_id).await?;
        self.realtime.messages.close(conversation_id);
        Ok(deleted)
    }

    /// Live conversation list of the signed-in user.
    pub fn subscribe_conversations(&self) -> Result<Subscription<Vec<ConversationSummary>>> {
        Ok(self.realtime.conversations.subscribe(&self.acting_id()?))
    }

    /// Live message list of a conversation the signed-in user takes part in.
    pub async fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Subscription<Vec<MessageModel>>> {
        self.participating(conversation_id).await?;
        Ok(self.realtime.messages.subscribe(conversation_id))
    }

    /// Live unread total of the signed-in user.
    pub fn subscribe_total_unread(&self) -> Result<Subscription<i64>> {
        Ok(self.realtime.total_unread.subscribe(&self.acting_id()?))
    }

    /// A conversation screen with optimistic sends.
    pub async fn conversation_view(&self, conversation_id: &str) -> Result<ConversationView> {
        let user_id = self.acting_id()?;
        let subscription = self.subscribe_messages(conversation_id).await?;
        Ok(ConversationView {
            ctx: self.ctx.clone(),
            conversation_id: conversation_id.to_string(),
            user_id,
            subscription,
            staged: StagedList::new(),
        })
    }

    // ---- reviews ----

    /// Reviews another user as the signed-in user.
    pub async fn review_user(
        &self,
        reviewee_id: &str,
        rating: i32,
        comment: &str,
        related_item_id: Option<&str>,
    ) -> Outcome<ReviewModel> {
        let result = async {
            let user_id = self.acting_id()?;
            review::create_review(
                self.db(),
                self.feed(),
                &user_id,
                reviewee_id,
                rating,
                comment,
                related_item_id,
                self.ctx.clock.now(),
            )
            .await
        };
        Outcome::from_result(result.await, "Review published")
    }

    // ---- notifications ----

    /// Notifications of the signed-in user, newest first.
    pub async fn notifications(&self) -> Result<Vec<NotificationModel>> {
        notification::list_for_user(self.db(), &self.acting_id()?).await
    }

    /// Marks one notification read.
    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        let user_id = self.acting_id()?;
        notification::mark_read(self.db(), self.feed(), &user_id, notification_id).await
    }

    /// Marks every notification read.
    pub async fn mark_all_notifications_read(&self) -> Result<u64> {
        let user_id = self.acting_id()?;
        notification::mark_all_read(self.db(), self.feed(), &user_id).await
    }

    /// Deletes one notification.
    pub async fn delete_notification(&self, notification_id: &str) -> Result<()> {
        let user_id = self.acting_id()?;
        notification::delete(self.db(), self.feed(), &user_id, notification_id).await
    }

    /// Deletes every read notification.
    pub async fn clear_read_notifications(&self) -> Result<u64> {
        let user_id = self.acting_id()?;
        notification::delete_all_read(self.db(), self.feed(), &user_id).await
    }

    /// Live notification list.
    pub fn subscribe_notifications(&self) -> Result<Subscription<Vec<NotificationModel>>> {
        Ok(self.realtime.notifications.subscribe(&self.acting_id()?))
    }

    /// Live unread-notification count.
    pub fn subscribe_unread_notifications(&self) -> Result<Subscription<u64>> {
        Ok(self
            .realtime
            .unread_notifications
            .subscribe(&self.acting_id()?))
    }

    // ---- administration ----

    /// Records a moderation decision on `owner_id`'s item and notifies them.
    pub async fn moderate_item(
        &self,
        owner_id: &str,
        item_id: &str,
        item_name: &str,
        rejection_reason: Option<&str>,
    ) -> Result<NotificationModel> {
        self.require_admin()?;
        match rejection_reason {
            Some(reason) => {
                notification::notify_item_rejected(
                    self.db(),
                    self.feed(),
                    owner_id,
                    item_id,
                    item_name,
                    reason,
                    self.ctx.clock.now(),
                )
                .await
            }
            None => {
                notification::notify_item_approved(
                    self.db(),
                    self.feed(),
                    owner_id,
                    item_id,
                    item_name,
                    self.ctx.clock.now(),
                )
                .await
            }
        }
    }

    /// Deletes another user's account and everything it owns.
    pub async fn delete_account(&self, target_id: &str) -> Result<()> {
        let acting = self.session.require_user()?;
        user::delete_account(self.db(), self.feed(), &acting, target_id).await
    }
}

/// Message list of one conversation with optimistic sends.
///
/// Sent messages appear as [`Entry::Pending`] right away and become
/// [`Entry::Confirmed`] once the live message list contains them.
pub struct ConversationView {
    ctx: AppContext,
    conversation_id: String,
    user_id: String,
    subscription: Subscription<Vec<MessageModel>>,
    staged: StagedList<MessageModel>,
}

impl ConversationView {
    /// Conversation shown by this view.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Confirmed messages followed by pending ones.
    pub fn entries(&self) -> Vec<Entry<MessageModel>> {
        self.staged.entries()
    }

    /// Number of sends not yet confirmed.
    pub fn pending(&self) -> usize {
        self.staged.pending_len()
    }

    /// Applies the latest snapshot, if one has arrived.
    pub fn refresh(&mut self) {
        if let Some(snapshot) = self.subscription.current() {
            self.staged.reconcile(snapshot);
        }
    }

    /// Waits for the next snapshot and applies it.
    pub async fn next_snapshot(&mut self) -> Result<()> {
        let snapshot = self.subscription.next().await?;
        self.staged.reconcile(snapshot);
        Ok(())
    }

    /// Waits until the snapshot contains `message_id` and applies it.
    pub async fn wait_confirmed(&mut self, message_id: &str) -> Result<()> {
        let snapshot = self
            .subscription
            .wait_for(|messages| messages.iter().any(|m| m.id == message_id))
            .await?;
        self.staged.reconcile(snapshot);
        Ok(())
    }

    /// Sends `content`, staging it as pending until the live list confirms it.
    ///
    /// A rejected send is removed from the pending set and the error returned.
    pub async fn send(&mut self, content: &str) -> Result<MessageModel> {
        let conversation = conversation::find(&self.ctx.database, &self.conversation_id)
            .await?
            .ok_or_else(|| Error::not_found("conversation", self.conversation_id.as_str()))?;
        let recipient_id = conversation
            .other_participant(&self.user_id)
            .unwrap_or_default()
            .to_string();

        let message_id = Uuid::new_v4().to_string();
        let now = self.ctx.clock.now();
        self.staged.stage(MessageModel {
            id: message_id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.user_id.clone(),
            recipient_id,
            content: content.trim().to_string(),
            timestamp: now,
            read: false,
        });

        let sent = conversation::send_message_with_id(
            &self.ctx.database,
            &self.ctx.feed,
            &self.conversation_id,
            &message_id,
            &self.user_id,
            content,
            now,
        )
        .await;
        match sent {
            Ok(message) => {
                debug!(message_id, "message staged");
                Ok(message)
            }
            Err(e) => {
                self.staged.fail(&message_id);
                info!(message_id, "send failed, pending entry dropped: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::session::SessionState;
    use crate::test_utils::*;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    async fn context() -> Result<(AppContext, Arc<ManualClock>)> {
        init_test_tracing();
        let db = setup_test_db().await?;
        let mut settings = Settings::default();
        settings.realtime.retry_delay_ms = 10;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = AppContext::new(db, settings).with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
        ctx.prepare().await?;
        Ok((ctx, clock))
    }

    fn registration(name: &str) -> Registration {
        Registration {
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            phone: "+56 9 0000 0000".to_string(),
            city: "Santiago".to_string(),
        }
    }

    async fn bounded<T>(future: impl std::future::Future<Output = T>) -> Result<T> {
        timeout(StdDuration::from_secs(2), future)
            .await
            .map_err(|_| Error::validation("timed out"))
    }

    #[tokio::test]
    async fn test_operations_require_session() -> Result<()> {
        let (ctx, _) = context().await?;
        let client = ctx.client();

        assert!(matches!(client.balance().await, Err(Error::NoActiveSession)));
        assert!(matches!(
            client.subscribe_conversations(),
            Err(Error::NoActiveSession)
        ));
        let outcome = client.redeem("highlight-7d").await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "No active session");
        Ok(())
    }

    #[tokio::test]
    async fn test_sign_up_grants_welcome_bonus() -> Result<()> {
        let (ctx, _) = context().await?;
        let client = ctx.client();

        let user = client.sign_up("ana", &registration("Ana")).await?;
        assert_eq!(user.points_balance, ctx.settings.points.signup_bonus);
        assert!(client.session().is_authenticated());
        Ok(())
    }

    #[tokio::test]
    async fn test_redemption_expires_with_clock() -> Result<()> {
        let (ctx, clock) = context().await?;
        let client = ctx.client();
        client.sign_up("ana", &registration("Ana")).await?;
        points::credit(&ctx.database, &ctx.feed, "ana", 20, "Gift", None, Utc::now()).await?;
        assert_eq!(client.balance().await?, 120);

        let outcome = client.redeem("highlight-7d").await;
        assert!(outcome.success, "{}", outcome.message);
        let redemption = outcome.data.unwrap();
        assert_eq!(client.balance().await?, 20);
        assert_eq!(
            redemption.expires_at,
            Some(redemption.redeemed_at + Duration::days(7))
        );
        assert_eq!(client.active_redemptions().await?.len(), 1);

        clock.advance(Duration::days(7) + Duration::seconds(1));
        assert!(client.active_redemptions().await?.is_empty());
        assert_eq!(client.redemptions().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_writes_share_the_context_clock() -> Result<()> {
        let (ctx, clock) = context().await?;
        let frozen = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        clock.set(frozen);

        let ana = ctx.client();
        ana.sign_up("ana", &registration("Ana")).await?;
        let redemption = ana.redeem("highlight-7d").await.data.unwrap();
        assert_eq!(redemption.redeemed_at, frozen);
        assert!(ana.points_history().await?.iter().all(|e| e.timestamp == frozen));

        let beto = ctx.client();
        let beto_record = beto.sign_up("beto", &registration("Beto")).await?;
        assert_eq!(beto_record.registered_at, frozen);
        clock.advance(Duration::hours(2));
        let conv = ana.open_conversation("beto", None).await?;
        let message = ana.send_message(&conv.id, "Hola").await?;
        assert_eq!(message.timestamp, frozen + Duration::hours(2));
        assert_eq!(conv.last_updated_at, frozen + Duration::hours(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_insufficient_points_outcome() -> Result<()> {
        let (ctx, _) = context().await?;
        let client = ctx.client();
        client.sign_up("ana", &registration("Ana")).await?;

        let outcome = client.redeem("premium-badge-30d").await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "You need 400 more points");
        Ok(())
    }

    #[tokio::test]
    async fn test_voucher_owner_check() -> Result<()> {
        let (ctx, _) = context().await?;
        let ana = ctx.client();
        let beto = ctx.client();
        ana.sign_up("ana", &registration("Ana")).await?;
        beto.sign_up("beto", &registration("Beto")).await?;

        let redemption = ana.redeem("premium-10-photos").await.data.unwrap();
        let result = beto.mark_voucher_used(&redemption.id, None).await;
        assert!(matches!(result, Err(Error::PermissionDenied { .. })));
        assert!(ana.mark_voucher_used(&redemption.id, Some("item-1")).await?);
        assert!(ana.active_redemptions().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_photo_cooldown_uses_clock() -> Result<()> {
        let (ctx, clock) = context().await?;
        let client = ctx.client();
        client.sign_up("ana", &registration("Ana")).await?;

        assert!(client.update_photo("https://cdn/1.png").await.success);
        let refused = client.update_photo("https://cdn/2.png").await;
        assert!(!refused.success);
        assert!(refused.message.contains("30 days"));

        clock.advance(Duration::days(30));
        assert!(client.update_photo("https://cdn/2.png").await.success);
        Ok(())
    }

    #[tokio::test]
    async fn test_messaging_between_two_clients() -> Result<()> {
        let (ctx, _) = context().await?;
        let ana = ctx.client();
        let beto = ctx.client();
        ana.sign_up("ana", &registration("Ana")).await?;
        beto.sign_up("beto", &registration("Beto")).await?;

        let mut unread = beto.subscribe_total_unread()?;
        assert_eq!(bounded(unread.first()).await??, 0);

        let conv = ana.open_conversation("beto", None).await?;
        ana.send_message(&conv.id, "Hola").await?;
        ana.send_message(&conv.id, "Sigue disponible?").await?;
        bounded(unread.wait_for(|n| *n == 2)).await??;

        assert_eq!(beto.mark_conversation_read(&conv.id).await?, 2);
        bounded(unread.wait_for(|n| *n == 0)).await??;

        let result = ctx.client().send_message(&conv.id, "x").await;
        assert!(matches!(result, Err(Error::NoActiveSession)));
        Ok(())
    }

    #[tokio::test]
    async fn test_outsider_cannot_watch_conversation() -> Result<()> {
        let (ctx, _) = context().await?;
        let ana = ctx.client();
        let carla = ctx.client();
        ana.sign_up("ana", &registration("Ana")).await?;
        carla.sign_up("carla", &registration("Carla")).await?;
        let conv = ana.open_conversation("beto", None).await?;

        let result = carla.subscribe_messages(&conv.id).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        let result = carla.delete_conversation(&conv.id).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_conversation_view_stages_sends() -> Result<()> {
        let (ctx, _) = context().await?;
        let ana = ctx.client();
        ana.sign_up("ana", &registration("Ana")).await?;
        let conv = ana.open_conversation("beto", None).await?;

        let mut view = ana.conversation_view(&conv.id).await?;
        let sent = view.send("Hola Beto").await?;
        assert_eq!(view.pending(), 1);
        assert!(view.entries().iter().any(|e| e.is_pending() && e.item().id == sent.id));

        bounded(view.wait_confirmed(&sent.id)).await??;
        assert_eq!(view.pending(), 0);
        assert!(matches!(view.entries().as_slice(), [Entry::Confirmed(m)] if m.id == sent.id));

        assert!(view.send("   ").await.is_err());
        assert_eq!(view.pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_conversation_list_names_other_participant() -> Result<()> {
        let (ctx, _) = context().await?;
        let ana = ctx.client();
        let beto = ctx.client();
        ana.sign_up("ana", &registration("Ana")).await?;
        beto.sign_up("beto", &registration("Beto")).await?;
        let conv = ana.open_conversation("beto", None).await?;

        let mut list = beto.subscribe_conversations()?;
        let summaries = bounded(list.first()).await??;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].other_user_name, "Ana");

        ana.send_message(&conv.id, "Hola").await?;
        let summaries = bounded(list.wait_for(|rows| rows[0].unread == 1)).await??;
        assert_eq!(summaries[0].conversation.last_message.as_deref(), Some("Hola"));
        Ok(())
    }

    #[tokio::test]
    async fn test_sign_out_tears_down_views() -> Result<()> {
        let (ctx, _) = context().await?;
        let ana = ctx.client();
        ana.sign_up("ana", &registration("Ana")).await?;
        let conv = ana.open_conversation("beto", None).await?;

        let mut conversations = ana.subscribe_conversations()?;
        let _messages = ana.subscribe_messages(&conv.id).await?;
        let _balance = ana.subscribe_balance()?;
        bounded(conversations.first()).await??;
        assert_eq!(ana.active_listeners(), 3);

        ana.sign_out().await?;
        assert_eq!(ana.active_listeners(), 0);
        let closed = bounded(conversations.next()).await?;
        assert!(matches!(closed, Err(Error::SubscriptionClosed { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_conversation_closes_listener() -> Result<()> {
        let (ctx, _) = context().await?;
        let ana = ctx.client();
        ana.sign_up("ana", &registration("Ana")).await?;
        let conv = ana.open_conversation("beto", None).await?;
        let _messages = ana.subscribe_messages(&conv.id).await?;

        assert!(ana.delete_conversation(&conv.id).await?);
        assert_eq!(ana.active_listeners(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_dual_session_forces_logout() -> Result<()> {
        let (ctx, _) = context().await?;
        let phone = ctx.client();
        let laptop = ctx.client();
        phone.sign_up("ana", &registration("Ana")).await?;
        let mut events = phone.dual_session_events();

        laptop.sign_in("ana").await?;
        let event = bounded(events.recv()).await?.unwrap();
        assert_eq!(event.user_id, "ana");
        assert!(matches!(
            phone.session().current_state(),
            SessionState::DualDetected { .. }
        ));
        assert!(matches!(phone.balance().await, Err(Error::NoActiveSession)));

        phone.sign_out().await?;
        assert!(laptop.session().is_authenticated());
        assert_eq!(laptop.balance().await?, ctx.settings.points.signup_bonus);
        Ok(())
    }

    #[tokio::test]
    async fn test_balance_stream_follows_trades() -> Result<()> {
        let (ctx, _) = context().await?;
        let client = ctx.client();
        client.sign_up("ana", &registration("Ana")).await?;
        let mut balance = client.subscribe_balance()?;
        bounded(balance.first()).await??;

        assert_eq!(client.complete_trade("item-1").await?, 200);
        let updated = bounded(balance.wait_for(|b| *b == Some(300))).await??;
        assert_eq!(updated, Some(300));
        Ok(())
    }

    #[tokio::test]
    async fn test_moderation_requires_admin() -> Result<()> {
        let (ctx, _) = context().await?;
        let admin = ctx.client();
        let ana = ctx.client();
        create_test_admin(&ctx.database, &ctx.feed, "root").await?;
        admin.sign_in("root").await?;
        ana.sign_up("ana", &registration("Ana")).await?;

        let result = ana.moderate_item("ana", "item-1", "Lamp", None).await;
        assert!(matches!(result, Err(Error::PermissionDenied { .. })));

        let mut unread = ana.subscribe_unread_notifications()?;
        admin
            .moderate_item("ana", "item-1", "Lamp", Some("Blurry photo"))
            .await?;
        bounded(unread.wait_for(|n| *n == 1)).await??;

        let notes = ana.notifications().await?;
        assert_eq!(notes[0].related_reason.as_deref(), Some("Blurry photo"));
        ana.mark_all_notifications_read().await?;
        assert_eq!(ana.clear_read_notifications().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_review_outcome() -> Result<()> {
        let (ctx, _) = context().await?;
        let ana = ctx.client();
        let beto = ctx.client();
        ana.sign_up("ana", &registration("Ana")).await?;
        beto.sign_up("beto", &registration("Beto")).await?;

        let own = ana.review_user("ana", 5, "I am the best trader", None).await;
        assert!(!own.success);
        assert_eq!(own.message, "You cannot rate yourself");

        let ok = ana.review_user("beto", 4, "Smooth and friendly trade", None).await;
        assert!(ok.success);
        Ok(())
    }
}
