//! The per-destination poll loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{PageConfig, PollConfig};
use crate::db::Storage;
use crate::error::{AppError, Result};
use crate::media::Mediator;
use crate::models::{FeedId, Subscription, SubscriptionValue};
use crate::render::{Renderer, Sender};
use crate::vendor::{Vendor, VendorRegistry};

use super::events::Notifier;
use super::metrics::Metrics;
use super::queue::{spawn_refresh, Update};
use super::registry::TaskRegistry;

/// Services shared by every poll task.
pub struct TaskContext {
    pub storage: Arc<dyn Storage>,
    pub vendors: Arc<VendorRegistry>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<Metrics>,
    pub sender: Arc<dyn Sender>,
    pub mediator: Mediator,
    pub poll: PollConfig,
    pub page: PageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No active subscription left for the destination.
    Idle,
    Delivered(usize),
    /// Nothing new; only `updated_at` moved.
    Heartbeat,
    /// Transient failure or a concurrent state change; try again next cycle.
    Skipped,
    Suspended,
}

pub struct PollTask {
    feed_id: FeedId,
    ctx: Arc<TaskContext>,
    /// Registry entry to retire from once the destination runs dry.
    lease: Option<(Arc<TaskRegistry<FeedId>>, u64)>,
}

impl PollTask {
    pub fn new(feed_id: FeedId, ctx: Arc<TaskContext>) -> Self {
        Self {
            feed_id,
            ctx,
            lease: None,
        }
    }

    /// Run as generation `generation` of the registry's entry for the feed.
    pub fn registered(mut self, registry: Arc<TaskRegistry<FeedId>>, generation: u64) -> Self {
        self.lease = Some((registry, generation));
        self
    }

    /// Serve the destination's subscriptions round-robin until cancelled or
    /// none is active any more.
    pub async fn run(self, token: CancellationToken) {
        let feed_id = self.feed_id;
        self.ctx.metrics.task_started();
        tracing::info!(feed_id, "Poll task started");

        loop {
            match self.cycle(&token).await {
                Ok(CycleOutcome::Idle) => {
                    if self.retire().await {
                        tracing::info!(feed_id, "No active subscriptions, poll task exits");
                        break;
                    }
                    // resumed while we were leaving
                    continue;
                }
                Ok(outcome) => tracing::debug!(feed_id, ?outcome, "Cycle finished"),
                Err(e) if e.is_cancellation() => break,
                Err(e) => tracing::warn!(feed_id, "Cycle failed: {}", e),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.poll.interval()) => {}
            }
        }

        self.ctx.metrics.task_stopped();
        tracing::info!(feed_id, "Poll task stopped");
    }

    /// Leave the registry unless a subscription became active meanwhile.
    async fn retire(&self) -> bool {
        let Some((registry, generation)) = &self.lease else {
            return true;
        };
        let storage = self.ctx.storage.clone();
        let feed_id = self.feed_id;
        registry
            .retire(&feed_id, *generation, move || async move {
                matches!(
                    storage.shift_subscription(feed_id).await,
                    Err(AppError::NotFound)
                )
            })
            .await
    }

    /// One refresh of the next due subscription.
    pub async fn cycle(&self, token: &CancellationToken) -> Result<CycleOutcome> {
        let sub = match self.ctx.storage.shift_subscription(self.feed_id).await {
            Ok(sub) => sub,
            Err(AppError::NotFound) => return Ok(CycleOutcome::Idle),
            Err(e) => return Err(e),
        };
        let counters = self.ctx.metrics.counters(self.feed_id, &sub.header.vendor);

        let vendor = match self.ctx.vendors.get(&sub.header.vendor) {
            Ok(vendor) => vendor,
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                return self.suspend(&sub, e.to_string()).await;
            }
        };

        let mut delivered = 0;
        let failure = match self.drain(&sub, vendor, token, &mut delivered).await {
            Ok(failure) => failure,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(AppError::NotFound) => {
                tracing::debug!(sub = %sub.header, "Subscription changed state during refresh");
                return Ok(CycleOutcome::Skipped);
            }
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                // the same item would come first again next cycle
                if delivered == 0 {
                    self.heartbeat(&sub).await?;
                }
                return Err(e);
            }
        };

        match failure {
            Some(e) if e.is_cancellation() => Err(e),
            Some(e) if e.is_transient() => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sub = %sub.header, "Refresh failed, retrying next cycle: {}", e);
                if delivered == 0 {
                    self.heartbeat(&sub).await?;
                }
                Ok(CycleOutcome::Skipped)
            }
            Some(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sub = %sub.header, "Refresh failed: {}", e);
                self.suspend(&sub, e.to_string()).await
            }
            None if delivered == 0 => {
                self.heartbeat(&sub).await?;
                counters.heartbeats.fetch_add(1, Ordering::Relaxed);
                Ok(CycleOutcome::Heartbeat)
            }
            None => Ok(CycleOutcome::Delivered(delivered)),
        }
    }

    /// Consume the refresh of `sub`: render, flush and persist each update.
    ///
    /// Counts persisted updates into `delivered`, which stays valid when this
    /// fails, and returns the terminal queue error.
    async fn drain(
        &self,
        sub: &Subscription,
        vendor: Arc<dyn Vendor>,
        token: &CancellationToken,
        delivered: &mut usize,
    ) -> Result<Option<AppError>> {
        let ctx = &self.ctx;
        let header = &sub.header;
        let counters = ctx.metrics.counters(self.feed_id, &header.vendor);
        let mut stream = spawn_refresh(
            vendor,
            header.clone(),
            sub.data.clone(),
            ctx.poll.preload(),
            token,
        );

        while let Some(update) = stream.next().await? {
            let (render, data) = match update {
                Update::Item { render, data } => (render, data),
                Update::Failed(e) => return Ok(Some(e)),
            };

            if let Some(render) = render {
                let mut renderer = Renderer::new(
                    self.feed_id,
                    ctx.sender.clone(),
                    ctx.mediator.clone(),
                    ctx.page.clone(),
                );
                render(&mut renderer)?;
                renderer.flush(token).await?;
            }

            ctx.storage
                .update_subscription(header, SubscriptionValue::Data(data))
                .await?;
            counters.updates.fetch_add(1, Ordering::Relaxed);
            *delivered += 1;
        }

        Ok(None)
    }

    /// Touch `updated_at` so the next cycle serves another subscription.
    async fn heartbeat(&self, sub: &Subscription) -> Result<()> {
        match self
            .ctx
            .storage
            .update_subscription(&sub.header, SubscriptionValue::Data(sub.data.clone()))
            .await
        {
            Ok(()) | Err(AppError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn suspend(&self, sub: &Subscription, reason: String) -> Result<CycleOutcome> {
        match self
            .ctx
            .storage
            .update_subscription(&sub.header, SubscriptionValue::Error(reason.clone()))
            .await
        {
            Ok(()) => {}
            Err(AppError::NotFound) => {
                tracing::debug!(sub = %sub.header, "Already suspended");
                return Ok(CycleOutcome::Skipped);
            }
            Err(e) => return Err(e),
        }

        self.ctx
            .metrics
            .counters(self.feed_id, &sub.header.vendor)
            .suspends
            .fetch_add(1, Ordering::Relaxed);

        let suspended = Subscription {
            error: Some(reason),
            ..sub.clone()
        };
        self.ctx.notifier.on_suspend(&suspended).await;
        Ok(CycleOutcome::Suspended)
    }
}
