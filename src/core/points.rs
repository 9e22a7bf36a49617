//! Points ledger business logic - Credits, debits, trade rewards and bonuses.
//!
//! Every balance change is one append to `points_transactions` plus a guarded
//! update of the cached `users.points_balance`, both inside a single database
//! transaction. The cached column is moved with `points_balance = points_balance ± n`
//! and debits carry a `points_balance >= n` condition, so concurrent writers can
//! never drive a balance negative or lose an update. The ledger entry records the
//! balance before and after the change as observed inside that transaction.

use crate::{
    config::PointsRules,
    core::user::{self, badges},
    entities::{
        PointsTransaction, User, VoucherRedemption,
        points_transaction::{self, PointsKind},
        user as user_entity, voucher_redemption,
    },
    errors::{Error, Result},
    realtime::{ChangeFeed, SnapshotQuery, Topic},
};
use chrono::{DateTime, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use tracing::{debug, info, instrument, warn};

/// Reason recorded on the welcome bonus entry; its presence makes the grant idempotent.
pub const SIGNUP_BONUS_REASON: &str = "Welcome bonus";
/// Reason recorded when an account is verified.
pub const VERIFY_ACCOUNT_REASON: &str = "Account verified";

/// Aggregated ledger figures for the rewards screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointsStats {
    /// Sum of earned and bonus entries
    pub total_earned: i64,
    /// Sum of spent entries
    pub total_spent: i64,
    /// Sum of expired entries
    pub total_expired: i64,
    /// Cached balance
    pub current_balance: i64,
    /// Number of redemptions
    pub vouchers_redeemed: u64,
    /// Number of ledger entries
    pub transaction_count: usize,
    /// Time of the newest ledger entry
    pub last_transaction: Option<DateTime<Utc>>,
}

/// Result of comparing the cached balance with the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    /// Balance found on the user record
    pub cached: i64,
    /// Sum of the ledger
    pub ledger: i64,
    /// Whether the user record had to be rewritten
    pub repaired: bool,
}

fn validate_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(Error::validation("Amount must be a positive number of points"));
    }
    Ok(())
}

/// Reads the cached balance for `user_id`.
///
/// Fails with `NoActiveSession` when the user does not resolve.
pub async fn balance<C>(db: &C, user_id: &str) -> Result<i64>
where
    C: ConnectionTrait,
{
    User::find_by_id(user_id)
        .one(db)
        .await?
        .map(|user| user.points_balance)
        .ok_or(Error::NoActiveSession)
}

/// Appends one ledger entry and moves the cached balance accordingly.
///
/// Must run inside a database transaction so the entry and the balance move
/// together. Returns `None` when a subtracting entry is rejected because the
/// balance is too low; nothing is written in that case.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn append_entry<C>(
    conn: &C,
    user_id: &str,
    kind: PointsKind,
    amount: i64,
    reason: &str,
    related_item_id: Option<&str>,
    related_voucher_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<points_transaction::Model>>
where
    C: ConnectionTrait,
{
    let delta = kind.signed(amount);

    let mut update = User::update_many()
        .col_expr(
            user_entity::Column::PointsBalance,
            Expr::col(user_entity::Column::PointsBalance).add(delta),
        )
        .filter(user_entity::Column::Id.eq(user_id));
    if delta < 0 {
        update = update.filter(user_entity::Column::PointsBalance.gte(amount));
    }
    let result = update.exec(conn).await?;

    if result.rows_affected == 0 {
        // Either the user is gone or the guard rejected the spend.
        let available = balance(conn, user_id).await?;
        debug!(user_id, amount, available, "ledger write rejected");
        return Ok(None);
    }

    let balance_after = balance(conn, user_id).await?;
    let entry = points_transaction::ActiveModel {
        user_id: Set(user_id.to_string()),
        kind: Set(kind),
        amount: Set(amount),
        reason: Set(reason.to_string()),
        related_item_id: Set(related_item_id.map(str::to_string)),
        related_voucher_id: Set(related_voucher_id.map(str::to_string)),
        timestamp: Set(now),
        balance_before: Set(balance_after - delta),
        balance_after: Set(balance_after),
        ..Default::default()
    };
    Ok(Some(entry.insert(conn).await?))
}

/// Credits `amount` earned points to `user_id`.
///
/// # Arguments
/// * `amount` - Positive number of points
/// * `reason` - Shown in the points history
/// * `related_item_id` - Item that triggered the reward, if any
#[instrument(skip(db, feed))]
pub async fn credit(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    amount: i64,
    reason: &str,
    related_item_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<points_transaction::Model> {
    validate_amount(amount)?;

    let txn = db.begin().await?;
    let entry = append_entry(
        &txn,
        user_id,
        PointsKind::Earned,
        amount,
        reason,
        related_item_id,
        None,
        now,
    )
    .await?
    .ok_or(Error::NoActiveSession)?;
    txn.commit().await?;

    info!(user_id, amount, balance = entry.balance_after, "Points credited");
    feed.publish(Topic::User(user_id.to_string()));
    Ok(entry)
}

/// Spends `amount` points of `user_id`.
///
/// Returns `false` without writing anything when the balance is lower than
/// `amount`. The balance check and the decrement are one guarded statement.
#[instrument(skip(db, feed))]
pub async fn debit(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    amount: i64,
    reason: &str,
    related_voucher_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    validate_amount(amount)?;

    let txn = db.begin().await?;
    let entry = append_entry(
        &txn,
        user_id,
        PointsKind::Spent,
        amount,
        reason,
        None,
        related_voucher_id,
        now,
    )
    .await?;
    let Some(entry) = entry else {
        return Ok(false);
    };
    txn.commit().await?;

    info!(user_id, amount, balance = entry.balance_after, "Points debited");
    feed.publish(Topic::User(user_id.to_string()));
    Ok(true)
}

/// Removes `amount` points that lapsed. Behaves like [`debit`] but records `expired`.
pub async fn expire(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    amount: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    validate_amount(amount)?;

    let txn = db.begin().await?;
    let Some(entry) =
        append_entry(&txn, user_id, PointsKind::Expired, amount, reason, None, None, now).await?
    else {
        return Ok(false);
    };
    txn.commit().await?;

    info!(user_id, amount, balance = entry.balance_after, "Points expired");
    feed.publish(Topic::User(user_id.to_string()));
    Ok(true)
}

/// Rewards a completed trade and returns the total points granted.
///
/// The trade counter is incremented first; the new count decides the reward.
/// A count of 1 pays `first_trade`, anything else pays `completed_trade`. When
/// the new count is a multiple of `milestone_interval` a separate bonus entry
/// of `milestone_bonus` is written as well. Trade-count badges are granted in
/// the same transaction.
#[instrument(skip(db, feed, rules))]
pub async fn award_for_completed_trade(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    rules: &PointsRules,
    user_id: &str,
    item_id: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let txn = db.begin().await?;

    let bumped = User::update_many()
        .col_expr(
            user_entity::Column::TradesCompleted,
            Expr::col(user_entity::Column::TradesCompleted).add(1),
        )
        .filter(user_entity::Column::Id.eq(user_id))
        .exec(&txn)
        .await?;
    if bumped.rows_affected == 0 {
        return Err(Error::NoActiveSession);
    }
    let trades = user::require_user(&txn, user_id).await?.trades_completed;

    let (base, reason) = if trades == 1 {
        (rules.first_trade, "First trade completed")
    } else {
        (rules.completed_trade, "Trade completed")
    };
    let mut total = 0;
    if base > 0 {
        append_entry(
            &txn,
            user_id,
            PointsKind::Earned,
            base,
            reason,
            Some(item_id),
            None,
            now,
        )
        .await?;
        total += base;
    }

    if rules.milestone_interval > 0
        && rules.milestone_bonus > 0
        && trades % rules.milestone_interval == 0
    {
        let milestone_reason = format!("Milestone bonus: {trades} trades");
        append_entry(
            &txn,
            user_id,
            PointsKind::Bonus,
            rules.milestone_bonus,
            &milestone_reason,
            Some(item_id),
            None,
            now,
        )
        .await?;
        total += rules.milestone_bonus;
    }

    if let Some(badge) = badges::for_trade_count(trades) {
        user::add_badge(&txn, user_id, badge).await?;
    }

    txn.commit().await?;
    info!(user_id, trades, total, "Trade rewarded");
    feed.publish(Topic::User(user_id.to_string()));
    Ok(total)
}

/// Grants the welcome bonus once. Returns false if it was granted before or is switched off.
pub async fn grant_signup_bonus(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    rules: &PointsRules,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    if rules.signup_bonus <= 0 {
        return Ok(false);
    }

    let txn = db.begin().await?;
    let already = PointsTransaction::find()
        .filter(points_transaction::Column::UserId.eq(user_id))
        .filter(points_transaction::Column::Reason.eq(SIGNUP_BONUS_REASON))
        .one(&txn)
        .await?;
    if already.is_some() {
        debug!(user_id, "signup bonus already granted");
        return Ok(false);
    }

    append_entry(
        &txn,
        user_id,
        PointsKind::Bonus,
        rules.signup_bonus,
        SIGNUP_BONUS_REASON,
        None,
        None,
        now,
    )
    .await?
    .ok_or(Error::NoActiveSession)?;
    txn.commit().await?;

    info!(user_id, amount = rules.signup_bonus, "Signup bonus granted");
    feed.publish(Topic::User(user_id.to_string()));
    Ok(true)
}

/// Marks the account verified, grants the `verified` badge and the verification reward.
///
/// Fails with `AlreadyProcessed` if the account is already verified.
pub async fn verify_account(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    rules: &PointsRules,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let txn = db.begin().await?;
    let flagged = User::update_many()
        .col_expr(user_entity::Column::Verified, Expr::value(true))
        .filter(user_entity::Column::Id.eq(user_id))
        .filter(user_entity::Column::Verified.eq(false))
        .exec(&txn)
        .await?;
    if flagged.rows_affected == 0 {
        user::require_user(&txn, user_id).await?;
        return Err(Error::AlreadyProcessed {
            message: "Account is already verified".to_string(),
        });
    }

    user::add_badge(&txn, user_id, badges::VERIFIED).await?;
    if rules.verify_account > 0 {
        append_entry(
            &txn,
            user_id,
            PointsKind::Earned,
            rules.verify_account,
            VERIFY_ACCOUNT_REASON,
            None,
            None,
            now,
        )
        .await?;
    }
    txn.commit().await?;

    info!(user_id, "Account verified");
    feed.publish(Topic::User(user_id.to_string()));
    Ok(rules.verify_account.max(0))
}

/// Ledger entries of `user_id`, newest first.
pub async fn history(db: &DatabaseConnection, user_id: &str) -> Result<Vec<points_transaction::Model>> {
    PointsTransaction::find()
        .filter(points_transaction::Column::UserId.eq(user_id))
        .order_by_desc(points_transaction::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Signed sum of every ledger entry of `user_id`.
pub async fn ledger_sum(db: &DatabaseConnection, user_id: &str) -> Result<i64> {
    let entries = history(db, user_id).await?;
    Ok(entries.iter().map(|e| e.kind.signed(e.amount)).sum())
}

/// Compares the cached balance with the ledger and repairs it if they differ.
pub async fn reconcile_balance(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
) -> Result<Reconciliation> {
    let txn = db.begin().await?;
    let cached = balance(&txn, user_id).await?;
    let entries = PointsTransaction::find()
        .filter(points_transaction::Column::UserId.eq(user_id))
        .all(&txn)
        .await?;
    let ledger: i64 = entries.iter().map(|e| e.kind.signed(e.amount)).sum();

    if cached == ledger {
        return Ok(Reconciliation {
            cached,
            ledger,
            repaired: false,
        });
    }

    warn!(user_id, cached, ledger, "cached balance diverged from ledger");
    User::update_many()
        .col_expr(user_entity::Column::PointsBalance, Expr::value(ledger))
        .filter(user_entity::Column::Id.eq(user_id))
        .exec(&txn)
        .await?;
    txn.commit().await?;

    feed.publish(Topic::User(user_id.to_string()));
    Ok(Reconciliation {
        cached,
        ledger,
        repaired: true,
    })
}

/// Totals for the rewards screen.
pub async fn stats(db: &DatabaseConnection, user_id: &str) -> Result<PointsStats> {
    let current_balance = balance(db, user_id).await?;
    let entries = history(db, user_id).await?;
    let vouchers_redeemed = VoucherRedemption::find()
        .filter(voucher_redemption::Column::UserId.eq(user_id))
        .count(db)
        .await?;

    let sum_of = |kinds: &[PointsKind]| -> i64 {
        entries
            .iter()
            .filter(|e| kinds.contains(&e.kind))
            .map(|e| e.amount)
            .sum()
    };

    Ok(PointsStats {
        total_earned: sum_of(&[PointsKind::Earned, PointsKind::Bonus]),
        total_spent: sum_of(&[PointsKind::Spent]),
        total_expired: sum_of(&[PointsKind::Expired]),
        current_balance,
        vouchers_redeemed,
        transaction_count: entries.len(),
        last_transaction: entries.first().map(|e| e.timestamp),
    })
}

/// Live cached balance of one user, `None` when the user does not exist.
pub struct BalanceQuery;

impl SnapshotQuery for BalanceQuery {
    type Snapshot = Option<i64>;
    const NAME: &'static str = "balance";

    fn topic(key: &str) -> Topic {
        Topic::User(key.to_string())
    }

    async fn load(db: &DatabaseConnection, key: &str) -> Result<Self::Snapshot> {
        match balance(db, key).await {
            Ok(points) => Ok(Some(points)),
            Err(Error::NoActiveSession) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
