//! Voucher business logic - Catalog reads, redemption and usage tracking.
//!
//! A redemption spends points, takes one unit of bounded stock and writes the
//! redemption record in one database transaction. Both the spend and the stock
//! decrement are guarded updates, so two users racing for the last unit cannot
//! both succeed and a balance cannot be overdrawn.

use crate::{
    config::catalog::VoucherConfig,
    core::points,
    entities::{
        Voucher, VoucherRedemption,
        points_transaction::PointsKind,
        voucher::{self, VoucherKind},
        voucher_redemption,
    },
    errors::{Error, Result},
    realtime::{ChangeFeed, Topic},
};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Characters a redemption code is drawn from.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Length of a redemption code.
pub const CODE_LENGTH: usize = 8;

const MAX_CODE_ATTEMPTS: usize = 16;

/// Writes the configured catalog to the `vouchers` table.
///
/// Existing entries get every field refreshed except `stock`, which is only
/// set when the entry is first inserted so redemptions survive a restart.
/// Returns the number of newly inserted entries.
pub async fn seed_catalog(db: &DatabaseConnection, entries: &[VoucherConfig]) -> Result<usize> {
    let mut inserted = 0;
    for entry in entries {
        if entry.points_required <= 0 {
            return Err(Error::Config {
                message: format!("Voucher {} must cost a positive amount of points", entry.id),
            });
        }

        match Voucher::find_by_id(entry.id.as_str()).one(db).await? {
            Some(existing) => {
                let mut active: voucher::ActiveModel = existing.into();
                active.name = Set(entry.name.clone());
                active.description = Set(entry.description.clone());
                active.points_required = Set(entry.points_required);
                active.kind = Set(entry.kind);
                active.active = Set(entry.active);
                active.duration_days = Set(entry.duration_days);
                active.update(db).await?;
            }
            None => {
                let active: voucher::ActiveModel = entry.to_model().into();
                active.insert(db).await?;
                inserted += 1;
            }
        }
    }

    info!(
        "Voucher catalog seeded: {} entries, {} new",
        entries.len(),
        inserted
    );
    Ok(inserted)
}

/// Catalog entries that can currently be redeemed, cheapest first.
pub async fn list_available(db: &DatabaseConnection) -> Result<Vec<voucher::Model>> {
    Voucher::find()
        .filter(voucher::Column::Active.eq(true))
        .order_by_asc(voucher::Column::PointsRequired)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Available catalog entries of one kind.
pub async fn list_by_kind(
    db: &DatabaseConnection,
    kind: VoucherKind,
) -> Result<Vec<voucher::Model>> {
    Voucher::find()
        .filter(voucher::Column::Active.eq(true))
        .filter(voucher::Column::Kind.eq(kind))
        .order_by_asc(voucher::Column::PointsRequired)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Finds a catalog entry by id.
pub async fn find(db: &DatabaseConnection, voucher_id: &str) -> Result<Option<voucher::Model>> {
    Voucher::find_by_id(voucher_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Draws a random code of [`CODE_LENGTH`] characters from [`CODE_ALPHABET`].
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect()
}

async fn unused_code<C>(conn: &C) -> Result<String>
where
    C: ConnectionTrait,
{
    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = generate_code();
        let clash = VoucherRedemption::find()
            .filter(voucher_redemption::Column::Code.eq(code.as_str()))
            .one(conn)
            .await?;
        if clash.is_none() {
            return Ok(code);
        }
        warn!("redemption code collision, drawing again");
    }
    Err(Error::Processing {
        message: "Could not generate a unique redemption code".to_string(),
    })
}

/// Redeems `voucher_id` for `user_id` at `now`.
///
/// Checks run in a fixed order and the first failure wins: unknown voucher,
/// inactive voucher, exhausted stock, insufficient balance. On success the
/// points are spent, bounded stock is decremented and the redemption is
/// stored with a fresh code and, for vouchers with a duration, an expiry.
///
/// # Errors
/// * `NotFound` - no catalog entry with that id
/// * `VoucherInactive` - the entry is switched off
/// * `OutOfStock` - bounded stock is exhausted
/// * `InsufficientBalance` - the balance is below the price
/// * `Processing` - the guarded spend was rejected after validation
#[instrument(skip(db, feed))]
pub async fn redeem(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    user_id: &str,
    voucher_id: &str,
    now: DateTime<Utc>,
) -> Result<voucher_redemption::Model> {
    let catalog_entry = find(db, voucher_id)
        .await?
        .ok_or_else(|| Error::not_found("voucher", voucher_id))?;
    if !catalog_entry.active {
        return Err(Error::VoucherInactive {
            voucher_id: voucher_id.to_string(),
        });
    }
    if catalog_entry.stock.is_some_and(|stock| stock <= 0) {
        return Err(Error::OutOfStock {
            voucher_id: voucher_id.to_string(),
        });
    }
    let available = points::balance(db, user_id).await?;
    if available < catalog_entry.points_required {
        return Err(Error::InsufficientBalance {
            available,
            required: catalog_entry.points_required,
        });
    }

    let txn = db.begin().await?;

    let reason = format!("Redeemed: {}", catalog_entry.name);
    let spent = points::append_entry(
        &txn,
        user_id,
        PointsKind::Spent,
        catalog_entry.points_required,
        &reason,
        None,
        Some(voucher_id),
        now,
    )
    .await?;
    if spent.is_none() {
        return Err(Error::Processing {
            message: "Points could not be deducted".to_string(),
        });
    }

    if catalog_entry.stock.is_some() {
        let taken = Voucher::update_many()
            .col_expr(
                voucher::Column::Stock,
                Expr::col(voucher::Column::Stock).sub(1),
            )
            .filter(voucher::Column::Id.eq(voucher_id))
            .filter(voucher::Column::Stock.gt(0))
            .exec(&txn)
            .await?;
        if taken.rows_affected == 0 {
            // Someone took the last unit after validation; the spend rolls back with the transaction.
            return Err(Error::OutOfStock {
                voucher_id: voucher_id.to_string(),
            });
        }
    }

    let snapshot = serde_json::to_value(&catalog_entry).map_err(|e| Error::Processing {
        message: format!("Could not snapshot voucher: {e}"),
    })?;
    let redemption = voucher_redemption::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        voucher_id: Set(voucher_id.to_string()),
        voucher_snapshot: Set(snapshot),
        user_id: Set(user_id.to_string()),
        redeemed_at: Set(now),
        expires_at: Set(catalog_entry
            .duration_days
            .map(|days| now + Duration::days(i64::from(days)))),
        used: Set(false),
        used_at: Set(None),
        code: Set(unused_code(&txn).await?),
        applied_item_id: Set(None),
    };
    let result = redemption.insert(&txn).await?;
    txn.commit().await?;

    info!(
        user_id,
        voucher_id,
        code = %result.code,
        "Voucher redeemed"
    );
    feed.publish(Topic::User(user_id.to_string()));
    Ok(result)
}

/// Marks a redemption as used, optionally recording the item it was applied to.
///
/// Returns false if the redemption does not exist or was already used.
pub async fn mark_used(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    redemption_id: &str,
    applied_item_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let mut update = VoucherRedemption::update_many()
        .col_expr(voucher_redemption::Column::Used, Expr::value(true))
        .col_expr(voucher_redemption::Column::UsedAt, Expr::value(Some(now)))
        .filter(voucher_redemption::Column::Id.eq(redemption_id))
        .filter(voucher_redemption::Column::Used.eq(false));
    if let Some(item_id) = applied_item_id {
        update = update.col_expr(
            voucher_redemption::Column::AppliedItemId,
            Expr::value(item_id),
        );
    }
    let result = update.exec(db).await?;
    if result.rows_affected == 0 {
        return Ok(false);
    }

    if let Some(redemption) = find_redemption(db, redemption_id).await? {
        feed.publish(Topic::User(redemption.user_id));
    }
    info!(redemption_id, "Voucher marked as used");
    Ok(true)
}

/// Finds a redemption by id.
pub async fn find_redemption(
    db: &DatabaseConnection,
    redemption_id: &str,
) -> Result<Option<voucher_redemption::Model>> {
    VoucherRedemption::find_by_id(redemption_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Every redemption of `user_id`, newest first.
pub async fn redemptions_for_user(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<voucher_redemption::Model>> {
    VoucherRedemption::find()
        .filter(voucher_redemption::Column::UserId.eq(user_id))
        .order_by_desc(voucher_redemption::Column::RedeemedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Redemptions of `user_id` that are unused and not expired at `now`.
pub async fn active_redemptions(
    db: &DatabaseConnection,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<voucher_redemption::Model>> {
    let all = redemptions_for_user(db, user_id).await?;
    Ok(all.into_iter().filter(|r| r.is_active_at(now)).collect())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::catalog::default_catalog;
    use crate::test_utils::*;

    async fn funded_user(db: &DatabaseConnection, feed: &ChangeFeed, id: &str, points: i64) -> Result<()> {
        create_test_user(db, feed, id).await?;
        points::credit(db, feed, id, points, "Funding", None, Utc::now()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_seed_catalog_keeps_runtime_stock() -> Result<()> {
        let (db, _feed) = setup_store().await?;
        let catalog = default_catalog();

        assert_eq!(seed_catalog(&db, &catalog).await?, catalog.len());
        Voucher::update_many()
            .col_expr(voucher::Column::Stock, Expr::value(Some(1)))
            .filter(voucher::Column::Id.eq("amazon-5usd"))
            .exec(&db)
            .await?;

        assert_eq!(seed_catalog(&db, &catalog).await?, 0);
        let entry = find(&db, "amazon-5usd").await?.unwrap();
        assert_eq!(entry.stock, Some(1));
        assert_eq!(list_available(&db).await?.len(), catalog.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_by_kind_filters_and_sorts() -> Result<()> {
        let (db, _feed) = setup_store().await?;
        let catalog = default_catalog();
        seed_catalog(&db, &catalog).await?;

        let benefits = list_by_kind(&db, VoucherKind::Benefit).await?;
        let expected = catalog
            .iter()
            .filter(|v| v.kind == VoucherKind::Benefit && v.active)
            .count();
        assert_eq!(benefits.len(), expected);
        assert!(benefits.iter().all(|v| v.kind == VoucherKind::Benefit));
        assert!(benefits.windows(2).all(|w| w[0].points_required <= w[1].points_required));

        Voucher::update_many()
            .col_expr(voucher::Column::Active, Expr::value(false))
            .filter(voucher::Column::Kind.eq(VoucherKind::Highlight))
            .exec(&db)
            .await?;
        assert!(list_by_kind(&db, VoucherKind::Highlight).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_with_duration_scenario() -> Result<()> {
        let (db, feed) = setup_store().await?;
        funded_user(&db, &feed, "ana", 120).await?;
        create_test_voucher(&db, "highlight", 100, None, Some(7)).await?;
        let now = Utc::now();

        let redemption = redeem(&db, &feed, "ana", "highlight", now).await?;
        assert_eq!(points::balance(&db, "ana").await?, 20);
        assert_eq!(redemption.expires_at, Some(now + Duration::days(7)));
        assert_eq!(redemption.code.len(), CODE_LENGTH);
        assert!(!redemption.used);

        let active = active_redemptions(&db, "ana", now).await?;
        assert_eq!(active.len(), 1);

        let later = now + Duration::days(8);
        assert!(active_redemptions(&db, "ana", later).await?.is_empty());
        assert_eq!(redemptions_for_user(&db, "ana").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_validation_order() -> Result<()> {
        let (db, feed) = setup_store().await?;
        funded_user(&db, &feed, "ana", 10).await?;
        create_test_voucher(&db, "empty", 500, Some(0), None).await?;
        create_test_voucher(&db, "pricey", 500, Some(3), None).await?;
        let now = Utc::now();

        let result = redeem(&db, &feed, "ana", "missing", now).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));

        // Out of stock wins over insufficient balance.
        let result = redeem(&db, &feed, "ana", "empty", now).await;
        assert!(matches!(result, Err(Error::OutOfStock { .. })));

        match redeem(&db, &feed, "ana", "pricey", now).await {
            Err(e @ Error::InsufficientBalance { .. }) => {
                assert_eq!(e.to_string(), "You need 490 more points");
            }
            other => panic!("expected insufficient balance, got {other:?}"),
        }

        Voucher::update_many()
            .col_expr(voucher::Column::Active, Expr::value(false))
            .filter(voucher::Column::Id.eq("pricey"))
            .exec(&db)
            .await?;
        let result = redeem(&db, &feed, "ana", "pricey", now).await;
        assert!(matches!(result, Err(Error::VoucherInactive { .. })));

        assert_eq!(points::balance(&db, "ana").await?, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_out_of_stock_regardless_of_balance() -> Result<()> {
        let (db, feed) = setup_store().await?;
        funded_user(&db, &feed, "rich", 1_000_000).await?;
        create_test_voucher(&db, "gone", 10, Some(0), None).await?;

        for _ in 0..3 {
            let result = redeem(&db, &feed, "rich", "gone", Utc::now()).await;
            assert!(matches!(result, Err(Error::OutOfStock { .. })));
        }
        assert_eq!(points::balance(&db, "rich").await?, 1_000_000);
        Ok(())
    }

    #[tokio::test]
    async fn test_redeem_decrements_bounded_stock() -> Result<()> {
        let (db, feed) = setup_store().await?;
        funded_user(&db, &feed, "ana", 100).await?;
        create_test_voucher(&db, "card", 40, Some(2), None).await?;

        let first = redeem(&db, &feed, "ana", "card", Utc::now()).await?;
        let second = redeem(&db, &feed, "ana", "card", Utc::now()).await?;
        assert_ne!(first.code, second.code);
        assert!(first.expires_at.is_none());
        assert_eq!(find(&db, "card").await?.unwrap().stock, Some(0));

        let result = redeem(&db, &feed, "ana", "card", Utc::now()).await;
        assert!(matches!(result, Err(Error::OutOfStock { .. })));
        assert_eq!(points::balance(&db, "ana").await?, 20);
        Ok(())
    }

    #[tokio::test]
    async fn test_racing_redemptions_take_last_unit_once() -> Result<()> {
        let (db, feed) = setup_store().await?;
        let users = ["ana", "beto", "carla", "diego", "elena"];
        for id in users {
            funded_user(&db, &feed, id, 100).await?;
        }
        create_test_voucher(&db, "last", 50, Some(1), None).await?;

        let mut handles = Vec::new();
        for id in users {
            let db = db.clone();
            let feed = feed.clone();
            handles.push(tokio::spawn(async move {
                (id, redeem(&db, &feed, id, "last", Utc::now()).await)
            }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                (id, Ok(_)) => winners.push(id),
                (_, Err(Error::OutOfStock { .. })) => {}
                (_, Err(e)) => return Err(e),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(find(&db, "last").await?.unwrap().stock, Some(0));
        assert_eq!(VoucherRedemption::find().count(&db).await?, 1);
        for id in users {
            let expected = if winners.contains(&id) { 50 } else { 100 };
            assert_eq!(points::balance(&db, id).await?, expected);
            assert_eq!(points::ledger_sum(&db, id).await?, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_spend_leaves_stock_and_records() -> Result<()> {
        let (db, feed) = setup_store().await?;
        funded_user(&db, &feed, "ana", 100).await?;
        create_test_voucher(&db, "card", 60, Some(5), None).await?;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let db = db.clone();
            let feed = feed.clone();
            handles.push(tokio::spawn(async move {
                redeem(&db, &feed, "ana", "card", Utc::now()).await
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(Error::InsufficientBalance { .. } | Error::Processing { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(find(&db, "card").await?.unwrap().stock, Some(4));
        assert_eq!(redemptions_for_user(&db, "ana").await?.len(), 1);
        assert_eq!(points::balance(&db, "ana").await?, 40);
        assert_eq!(points::history(&db, "ana").await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_mark_used_removes_from_active() -> Result<()> {
        let (db, feed) = setup_store().await?;
        funded_user(&db, &feed, "ana", 100).await?;
        create_test_voucher(&db, "premium", 50, None, None).await?;
        let now = Utc::now();

        let redemption = redeem(&db, &feed, "ana", "premium", now).await?;
        assert!(mark_used(&db, &feed, &redemption.id, Some("item-9"), now).await?);
        assert!(!mark_used(&db, &feed, &redemption.id, None, now).await?);
        assert!(!mark_used(&db, &feed, "unknown", None, now).await?);

        assert!(active_redemptions(&db, "ana", now).await?.is_empty());
        let stored = redemptions_for_user(&db, "ana").await?;
        assert_eq!(stored[0].applied_item_id.as_deref(), Some("item-9"));
        assert!(stored[0].used_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_survives_catalog_edits() -> Result<()> {
        let (db, feed) = setup_store().await?;
        funded_user(&db, &feed, "ana", 100).await?;
        create_test_voucher(&db, "promo", 30, None, None).await?;

        let redemption = redeem(&db, &feed, "ana", "promo", Utc::now()).await?;
        create_test_voucher(&db, "promo", 90, None, None).await?;

        let snapshot: voucher::Model = serde_json::from_value(redemption.voucher_snapshot).unwrap();
        assert_eq!(snapshot.points_required, 30);
        assert_eq!(find(&db, "promo").await?.unwrap().points_required, 90);
        Ok(())
    }

    #[test]
    fn test_generated_codes_use_alphabet() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }
}
