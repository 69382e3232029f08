//! Subscription lifecycle and the per-destination poll tasks.
//!
//! A subscription is either active or suspended; deletion removes the row.
//! Every destination with an active subscription is served by exactly one
//! [`PollTask`], started through the [`TaskRegistry`].

mod events;
mod metrics;
mod queue;
mod registry;
mod task;

#[cfg(test)]
mod testing;

use std::sync::Arc;

pub use events::{ChatNotifier, LogNotifier, Notifier, Notifiers};
pub use metrics::Metrics;
pub use queue::{RenderFn, UpdateSink};
#[cfg(test)]
pub use queue::{channel, Update};
pub use registry::TaskRegistry;
pub use task::{PollTask, TaskContext};

use crate::error::{AppError, Result};
use crate::models::{FeedId, Header, Subscription, SubscriptionValue};
use crate::vendor::SubscribeOptions;

/// Reason recorded for subscriptions created suspended.
pub const DEADBORN_REASON: &str = "created suspended";

pub struct Poller {
    ctx: Arc<TaskContext>,
    tasks: Arc<TaskRegistry<FeedId>>,
    /// Whether lifecycle operations start poll tasks in this process.
    serve: bool,
}

impl Poller {
    pub fn new(ctx: Arc<TaskContext>) -> Self {
        Self {
            ctx,
            tasks: Arc::new(TaskRegistry::new()),
            serve: true,
        }
    }

    /// A poller that only edits stored state and leaves polling to a running
    /// `run` process, which picks changes up on its next rescan.
    pub fn offline(ctx: Arc<TaskContext>) -> Self {
        Self {
            serve: false,
            ..Self::new(ctx)
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    pub async fn subscribe(
        &self,
        feed_id: FeedId,
        reference: &str,
        options: &SubscribeOptions,
    ) -> Result<Subscription> {
        let (vendor, draft) = self.ctx.vendors.parse(reference, options).await?;
        let mut sub = Subscription::from_draft(feed_id, vendor.name(), draft);
        if options.deadborn {
            sub.error = Some(DEADBORN_REASON.to_string());
        }

        self.ctx.storage.create_subscription(&sub).await?;
        tracing::info!(sub = %sub.header, name = %sub.name, active = sub.is_active(), "Subscribed");

        if sub.is_active() {
            self.start(feed_id).await;
            self.ctx.notifier.on_resume(&sub).await;
        } else {
            self.ctx.notifier.on_suspend(&sub).await;
        }
        Ok(sub)
    }

    /// Suspend an active subscription. `None` records a voluntary suspension.
    pub async fn suspend(&self, header: &Header, reason: Option<&str>) -> Result<Subscription> {
        let reason = match reason {
            Some(reason) => reason.to_string(),
            None => AppError::UserSuspended.to_string(),
        };
        self.ctx
            .storage
            .update_subscription(header, SubscriptionValue::Error(reason))
            .await?;

        let sub = self.ctx.storage.get_subscription(header).await?;
        tracing::info!(sub = %header, "Suspended");
        self.ctx.notifier.on_suspend(&sub).await;
        Ok(sub)
    }

    pub async fn resume(&self, header: &Header) -> Result<Subscription> {
        let vendor = self.ctx.vendors.get(&header.vendor)?;
        vendor.before_resume(header).await?;

        self.ctx
            .storage
            .update_subscription(header, SubscriptionValue::Resume)
            .await?;
        self.start(header.feed_id).await;

        let sub = self.ctx.storage.get_subscription(header).await?;
        tracing::info!(sub = %header, "Resumed");
        self.ctx.notifier.on_resume(&sub).await;
        Ok(sub)
    }

    pub async fn delete(&self, header: &Header) -> Result<Subscription> {
        let sub = self.ctx.storage.get_subscription(header).await?;
        self.ctx.storage.delete_subscription(header).await?;
        tracing::info!(sub = %header, "Deleted");
        self.ctx.notifier.on_delete(&sub).await;
        Ok(sub)
    }

    /// Delete the suspended subscriptions of `feed_id` whose reason matches
    /// the SQL `LIKE` pattern.
    pub async fn clear(&self, feed_id: FeedId, pattern: &str) -> Result<u64> {
        let count = self
            .ctx
            .storage
            .delete_all_subscriptions(feed_id, pattern)
            .await?;
        tracing::info!(feed_id, pattern, count, "Cleared");
        self.ctx.notifier.on_delete_all(feed_id, pattern, count).await;
        Ok(count)
    }

    /// Start a task for every destination with an active subscription.
    ///
    /// Returns how many tasks were started; destinations already served are
    /// skipped.
    pub async fn restore_active(&self) -> Result<usize> {
        let mut started = 0;
        for feed_id in self.ctx.storage.active_feed_ids().await? {
            if self.tasks.is_running(&feed_id).await {
                continue;
            }

            for sub in self.ctx.storage.list_subscriptions(feed_id, true).await? {
                let hook = match self.ctx.vendors.get(&sub.header.vendor) {
                    Ok(vendor) => vendor.before_resume(&sub.header).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = hook {
                    tracing::warn!(sub = %sub.header, "Restore hook failed: {}", e);
                }
            }

            if self.start(feed_id).await {
                started += 1;
            }
        }

        if started > 0 {
            tracing::info!(started, "Restored poll tasks");
        }
        Ok(started)
    }

    pub async fn get(&self, header: &Header) -> Result<Subscription> {
        self.ctx.storage.get_subscription(header).await
    }

    pub async fn list(&self, feed_id: FeedId, active: bool) -> Result<Vec<Subscription>> {
        self.ctx.storage.list_subscriptions(feed_id, active).await
    }

    pub async fn is_running(&self, feed_id: FeedId) -> bool {
        self.tasks.is_running(&feed_id).await
    }

    /// Stop every poll task and wait for them.
    pub async fn close(&self) {
        self.tasks.close().await;
        tracing::info!("Poller closed");
    }

    async fn start(&self, feed_id: FeedId) -> bool {
        if !self.serve {
            tracing::debug!(feed_id, "Not serving, task left to the poller process");
            return false;
        }
        let ctx = self.ctx.clone();
        let registry = self.tasks.clone();
        self.tasks
            .submit(feed_id, move |token, generation| {
                PollTask::new(feed_id, ctx)
                    .registered(registry, generation)
                    .run(token)
            })
            .await
    }
}
