use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Repository;
use crate::error::Result;
use crate::media::Mediator;
use crate::models::{FeedId, Header, Subscription};
use crate::poller::{ChatNotifier, LogNotifier, Metrics, Notifiers, Poller, TaskContext};
use crate::render::{ConsoleSender, Sender};
use crate::vendor::{RssVendor, SubscribeOptions, VendorRegistry};

/// Subscription counts of one destination.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub active: usize,
    pub suspended: usize,
}

pub struct App {
    config: Config,
    repository: Arc<Repository>,
    poller: Poller,
    /// Stops in-flight media mediations on shutdown.
    shutdown: CancellationToken,
}

impl App {
    /// `serve` decides whether lifecycle commands start poll tasks here or
    /// leave them to a separate `run` process.
    pub async fn new(config: &Config, serve: bool) -> Result<Self> {
        let repository = Arc::new(Repository::new(&config.db_path).await?);
        Self::with_parts(config, repository, Arc::new(ConsoleSender), serve)
    }

    fn with_parts(
        config: &Config,
        repository: Arc<Repository>,
        sender: Arc<dyn Sender>,
        serve: bool,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.media.timeout())
            .connect_timeout(std::time::Duration::from_secs(10))
            .user_agent(config.user_agent.as_str())
            .build()?;

        let shutdown = CancellationToken::new();
        let mediator = Mediator::builder(client, config.media.clone())
            .configured()
            .hash_store(repository.clone())
            .cancellation(shutdown.clone())
            .build();

        let notifier = Notifiers::new()
            .with(Arc::new(LogNotifier))
            .with(Arc::new(ChatNotifier::new(sender.clone())));

        let mut vendors = VendorRegistry::new();
        vendors.register(Arc::new(RssVendor::new(&config.user_agent)?));

        let ctx = TaskContext {
            storage: repository.clone(),
            vendors: Arc::new(vendors),
            notifier: Arc::new(notifier),
            metrics: Arc::new(Metrics::new()),
            sender,
            mediator,
            poll: config.poll.clone(),
            page: config.page.clone(),
        };

        let ctx = Arc::new(ctx);
        let poller = if serve {
            Poller::new(ctx)
        } else {
            Poller::offline(ctx)
        };

        Ok(Self {
            config: config.clone(),
            repository,
            poller,
            shutdown,
        })
    }

    /// Serve all active subscriptions until Ctrl-C.
    ///
    /// Destinations are rescanned periodically so subscriptions added by other
    /// invocations get a task too.
    pub async fn run(&self) -> Result<()> {
        let started = self.poller.restore_active().await?;
        tracing::info!(started, "Polling");

        let mut rescan = tokio::time::interval(self.config.poll.rescan());
        rescan.tick().await;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutting down");
                    break;
                }
                _ = rescan.tick() => {
                    if let Err(e) = self.poller.restore_active().await {
                        tracing::warn!("Rescan failed: {}", e);
                    }
                    self.log_metrics();
                }
            }
        }

        Ok(())
    }

    pub async fn subscribe(
        &self,
        feed_id: FeedId,
        reference: &str,
        options: &SubscribeOptions,
    ) -> Result<Subscription> {
        self.poller.subscribe(feed_id, reference, options).await
    }

    pub async fn suspend(&self, header: &Header, reason: Option<&str>) -> Result<Subscription> {
        self.poller.suspend(header, reason).await
    }

    pub async fn resume(&self, header: &Header) -> Result<Subscription> {
        self.poller.resume(header).await
    }

    pub async fn delete(&self, header: &Header) -> Result<Subscription> {
        self.poller.delete(header).await
    }

    pub async fn clear(&self, feed_id: FeedId, pattern: &str) -> Result<u64> {
        self.poller.clear(feed_id, pattern).await
    }

    pub async fn list(&self, feed_id: Option<FeedId>) -> Result<Vec<Subscription>> {
        match feed_id {
            Some(feed_id) => {
                let mut subs = self.poller.list(feed_id, true).await?;
                subs.extend(self.poller.list(feed_id, false).await?);
                Ok(subs)
            }
            None => self.repository.list_all_subscriptions().await,
        }
    }

    pub async fn stats(&self) -> Result<BTreeMap<FeedId, FeedStats>> {
        let mut stats: BTreeMap<FeedId, FeedStats> = BTreeMap::new();
        for sub in self.repository.list_all_subscriptions().await? {
            let entry = stats.entry(sub.header.feed_id).or_default();
            if sub.is_active() {
                entry.active += 1;
            } else {
                entry.suspended += 1;
            }
        }
        Ok(stats)
    }

    /// Stop every poll task and pending mediation.
    pub async fn shutdown(&self) {
        self.poller.close().await;
        self.shutdown.cancel();
    }

    fn log_metrics(&self) {
        let metrics = self.poller.metrics();
        for ((feed_id, vendor), counters) in metrics.all() {
            tracing::info!(
                feed_id,
                vendor = %vendor,
                updates = counters.updates,
                failures = counters.failures,
                suspends = counters.suspends,
                heartbeats = counters.heartbeats,
                "Metrics"
            );
        }
        tracing::debug!(running_tasks = metrics.running_tasks(), "Tasks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Storage;
    use crate::models::{Draft, SubscriptionValue};

    async fn app_serving(serve: bool) -> App {
        let repository = Arc::new(Repository::open_in_memory().await.unwrap());
        App::with_parts(&Config::default(), repository, Arc::new(ConsoleSender), serve).unwrap()
    }

    async fn app() -> App {
        app_serving(true).await
    }

    async fn insert(app: &App, feed_id: FeedId, sub_id: &str) -> Header {
        let sub = Subscription::from_draft(
            feed_id,
            "rss",
            Draft {
                sub_id: sub_id.to_string(),
                name: sub_id.to_string(),
                data: String::new(),
            },
        );
        app.repository.create_subscription(&sub).await.unwrap();
        sub.header
    }

    #[tokio::test]
    async fn stats_count_active_and_suspended_per_destination() {
        let app = app().await;
        insert(&app, 1, "a").await;
        let b = insert(&app, 1, "b").await;
        insert(&app, 2, "c").await;
        app.repository
            .update_subscription(&b, SubscriptionValue::Error("gone".to_string()))
            .await
            .unwrap();

        let stats = app.stats().await.unwrap();
        assert_eq!(stats[&1], FeedStats { active: 1, suspended: 1 });
        assert_eq!(stats[&2], FeedStats { active: 1, suspended: 0 });
    }

    #[tokio::test]
    async fn list_filters_by_destination() {
        let app = app().await;
        insert(&app, 1, "a").await;
        insert(&app, 2, "b").await;

        assert_eq!(app.list(None).await.unwrap().len(), 2);
        let only = app.list(Some(2)).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].header.sub_id, "b");
    }

    #[tokio::test]
    async fn rss_vendor_is_registered() {
        let app = app().await;
        let err = app
            .subscribe(1, "not a url", &SubscribeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::AppError::NoMatchingVendor(_)));
        app.shutdown().await;
    }

    #[tokio::test]
    async fn command_app_resumes_without_polling() {
        let app = app_serving(false).await;
        let header = insert(&app, 5, "a").await;
        app.suspend(&header, Some("later")).await.unwrap();

        let sub = app.resume(&header).await.unwrap();
        assert!(sub.is_active());
        assert!(!app.poller.is_running(5).await);
        app.shutdown().await;
    }
}
