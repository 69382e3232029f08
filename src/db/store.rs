use async_trait::async_trait;

use crate::error::Result;
use crate::models::{FeedId, Header, MediaHash, Subscription, SubscriptionValue};

/// Persistence contract for subscriptions.
///
/// Guarded writes report `AppError::NotFound` when the row is missing or not in
/// the expected prior state.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Destinations with at least one active subscription.
    async fn active_feed_ids(&self) -> Result<Vec<FeedId>>;

    /// Fails with `AppError::Exists` when the header is taken.
    async fn create_subscription(&self, sub: &Subscription) -> Result<()>;

    async fn get_subscription(&self, header: &Header) -> Result<Subscription>;

    /// Next due active subscription of a destination, oldest `updated_at` first.
    async fn shift_subscription(&self, feed_id: FeedId) -> Result<Subscription>;

    async fn list_subscriptions(&self, feed_id: FeedId, active: bool) -> Result<Vec<Subscription>>;

    async fn update_subscription(&self, header: &Header, value: SubscriptionValue) -> Result<()>;

    async fn delete_subscription(&self, header: &Header) -> Result<()>;

    /// Deletes suspended subscriptions whose reason matches a `LIKE` pattern.
    async fn delete_all_subscriptions(&self, feed_id: FeedId, pattern: &str) -> Result<u64>;
}

/// Content hash bookkeeping used for media deduplication.
#[async_trait]
pub trait HashStore: Send + Sync {
    /// Inserts the hash, or bumps `collisions` and `last_seen` when it is
    /// already known, and returns the stored row.
    async fn check_unique(&self, hash: &MediaHash) -> Result<MediaHash>;
}
