//! Review business logic - Ratings users leave each other after a trade.
//!
//! Writing a review recomputes the reviewee's average rating, which is cached
//! on the user record like the points balance.

use crate::{
    core::user,
    entities::{Review, review},
    errors::{Error, Result},
    realtime::{ChangeFeed, Topic},
};
use chrono::{DateTime, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use tracing::info;
use uuid::Uuid;

/// Shortest accepted comment, after trimming.
pub const MIN_COMMENT_CHARS: usize = 10;
/// Longest accepted comment.
pub const MAX_COMMENT_CHARS: usize = 500;

/// Rating summary for a profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RatingStats {
    /// Number of reviews received
    pub total: usize,
    /// Mean rating, 0 without reviews
    pub average: f64,
    /// Count of 1 to 5 star reviews, index 0 is one star
    pub stars: [usize; 5],
}

impl RatingStats {
    #[allow(clippy::cast_precision_loss)]
    fn from_ratings(ratings: impl IntoIterator<Item = i32>) -> Self {
        let mut stats = Self::default();
        let mut sum = 0_i64;
        for rating in ratings {
            stats.total += 1;
            sum += i64::from(rating);
            if let Some(slot) = usize::try_from(rating - 1)
                .ok()
                .and_then(|i| stats.stars.get_mut(i))
            {
                *slot += 1;
            }
        }
        if stats.total > 0 {
            stats.average = sum as f64 / stats.total as f64;
        }
        stats
    }
}

/// Leaves a review of `reviewee_id` written by `reviewer_id`.
///
/// # Errors
/// * `Validation` - rating outside 1 to 5, comment too short or too long, or a self-review
/// * `NotFound` - reviewer or reviewee does not exist
#[allow(clippy::too_many_arguments)]
pub async fn create_review(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    reviewer_id: &str,
    reviewee_id: &str,
    rating: i32,
    comment: &str,
    related_item_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<review::Model> {
    if !(1..=5).contains(&rating) {
        return Err(Error::validation("Rating must be between 1 and 5"));
    }
    let comment = comment.trim();
    if comment.chars().count() < MIN_COMMENT_CHARS {
        return Err(Error::validation(format!(
            "Comment must have at least {MIN_COMMENT_CHARS} characters"
        )));
    }
    if comment.chars().count() > MAX_COMMENT_CHARS {
        return Err(Error::validation(format!(
            "Comment cannot exceed {MAX_COMMENT_CHARS} characters"
        )));
    }
    if reviewer_id == reviewee_id {
        return Err(Error::validation("You cannot rate yourself"));
    }

    let txn = db.begin().await?;
    let reviewer = user::require_user(&txn, reviewer_id).await?;
    user::require_user(&txn, reviewee_id).await?;

    let model = review::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        reviewer_id: Set(reviewer_id.to_string()),
        reviewer_name: Set(reviewer.name),
        reviewee_id: Set(reviewee_id.to_string()),
        rating: Set(rating),
        comment: Set(comment.to_string()),
        created_at: Set(now),
        related_item_id: Set(related_item_id.map(str::to_string)),
    };
    let result = model.insert(&txn).await?;

    let ratings = Review::find()
        .filter(review::Column::RevieweeId.eq(reviewee_id))
        .all(&txn)
        .await?;
    let stats = RatingStats::from_ratings(ratings.iter().map(|r| r.rating));
    user::set_rating(&txn, reviewee_id, stats.average).await?;
    txn.commit().await?;

    info!(reviewee_id, average = stats.average, "Review created");
    feed.publish(Topic::User(reviewee_id.to_string()));
    Ok(result)
}

/// Reviews received by `user_id`, newest first.
pub async fn reviews_for_user(db: &DatabaseConnection, user_id: &str) -> Result<Vec<review::Model>> {
    Review::find()
        .filter(review::Column::RevieweeId.eq(user_id))
        .order_by_desc(review::Column::CreatedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Rating summary of `user_id`.
pub async fn rating_stats(db: &DatabaseConnection, user_id: &str) -> Result<RatingStats> {
    let reviews = reviews_for_user(db, user_id).await?;
    Ok(RatingStats::from_ratings(reviews.iter().map(|r| r.rating)))
}

/// Whether `reviewer_id` has already reviewed `reviewee_id`.
pub async fn has_reviewed(db: &DatabaseConnection, reviewer_id: &str, reviewee_id: &str) -> Result<bool> {
    let found = Review::find()
        .filter(review::Column::ReviewerId.eq(reviewer_id))
        .filter(review::Column::RevieweeId.eq(reviewee_id))
        .one(db)
        .await?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[tokio::test]
    async fn test_review_updates_average() -> Result<()> {
        let (db, feed) = setup_store().await?;
        create_test_user(&db, &feed, "ana").await?;
        create_test_user(&db, &feed, "beto").await?;
        create_test_user(&db, &feed, "carla").await?;

        let now = Utc::now();
        create_review(&db, &feed, "ana", "beto", 5, "Great trade, very kind", None, now).await?;
        create_review(&db, &feed, "carla", "beto", 2, "Item arrived damaged", Some("item-4"), now)
            .await?;

        let beto = user::require_user(&db, "beto").await?;
        assert!((beto.rating - 3.5).abs() < f64::EPSILON);

        let stats = rating_stats(&db, "beto").await?;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.stars, [0, 1, 0, 0, 1]);
        assert!(has_reviewed(&db, "ana", "beto").await?);
        assert!(!has_reviewed(&db, "beto", "ana").await?);

        let reviews = reviews_for_user(&db, "beto").await?;
        assert_eq!(reviews[0].reviewer_name, "User carla");
        Ok(())
    }

    #[tokio::test]
    async fn test_review_validation() -> Result<()> {
        let (db, feed) = setup_store().await?;
        create_test_user(&db, &feed, "ana").await?;
        create_test_user(&db, &feed, "beto").await?;

        for (rating, comment, reviewee) in [
            (0, "Long enough comment", "beto"),
            (6, "Long enough comment", "beto"),
            (4, "   short   ", "beto"),
            (4, "Long enough comment", "ana"),
        ] {
            let result =
                create_review(&db, &feed, "ana", reviewee, rating, comment, None, Utc::now()).await;
            assert!(matches!(result, Err(Error::Validation { .. })));
        }

        let too_long = "x".repeat(MAX_COMMENT_CHARS + 1);
        let result = create_review(&db, &feed, "ana", "beto", 4, &too_long, None, Utc::now()).await;
        assert!(matches!(result, Err(Error::Validation { .. })));

        assert_eq!(rating_stats(&db, "beto").await?, RatingStats::default());
        Ok(())
    }
}
