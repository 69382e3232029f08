//! Shared fixtures for the poller tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;

use crate::config::{MediaConfig, PageConfig, PollConfig};
use crate::db::{Repository, Storage};
use crate::error::{AppError, Result};
use crate::media::Mediator;
use crate::models::{Draft, FeedId, Header, Subscription};
use crate::render::{Message, Sender, Writer};
use crate::vendor::{SubscribeOptions, Vendor, VendorRegistry};

use super::events::Notifier;
use super::metrics::Metrics;
use super::queue::{RenderFn, UpdateSink};
use super::task::TaskContext;

pub enum Behavior {
    Emit(Vec<&'static str>),
    Fail(&'static str),
    Transient,
    Cancel,
    Panic,
}

/// Accepts `test:<id>` references.
pub struct TestVendor {
    behavior: Behavior,
    pub resumed: AtomicUsize,
}

fn render_text(text: String) -> RenderFn {
    Box::new(move |w: &mut dyn Writer| {
        w.text(&text);
        Ok(())
    })
}

#[async_trait]
impl Vendor for TestVendor {
    fn name(&self) -> &str {
        "test"
    }

    async fn parse(&self, reference: &str, _options: &SubscribeOptions) -> Result<Option<Draft>> {
        Ok(reference.strip_prefix("test:").map(|id| Draft {
            sub_id: id.to_string(),
            name: format!("Test {id}"),
            data: "\"0\"".to_string(),
        }))
    }

    async fn refresh(&self, _header: &Header, queue: &mut UpdateSink) -> Result<()> {
        let _last: String = queue.init()?;
        match &self.behavior {
            Behavior::Emit(items) => {
                for item in items {
                    queue.submit(Some(render_text(format!("item {item}"))), *item).await?;
                }
                Ok(())
            }
            Behavior::Fail(msg) => Err(AppError::Vendor(msg.to_string())),
            Behavior::Transient => Err(AppError::HttpStatus {
                status: 503,
                url: "https://example.com/feed".to_string(),
            }),
            Behavior::Cancel => queue.cancel(AppError::Cancelled).await,
            Behavior::Panic => panic!("vendor exploded"),
        }
    }

    async fn before_resume(&self, _header: &Header) -> Result<()> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct Collect {
    pub fail: bool,
    pub messages: Mutex<Vec<Message>>,
}

#[async_trait]
impl Sender for Collect {
    async fn send(&self, _feed_id: FeedId, message: Message) -> Result<()> {
        if self.fail {
            return Err(AppError::Other(anyhow::anyhow!("chat unavailable")));
        }
        self.messages.lock().await.push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for Recorder {
    async fn on_resume(&self, sub: &Subscription) {
        self.events.lock().await.push(format!("resume {}", sub.header.sub_id));
    }

    async fn on_suspend(&self, sub: &Subscription) {
        let reason = sub.error.as_deref().unwrap_or_default();
        self.events
            .lock()
            .await
            .push(format!("suspend {}: {}", sub.header.sub_id, reason));
    }

    async fn on_delete(&self, sub: &Subscription) {
        self.events.lock().await.push(format!("delete {}", sub.header.sub_id));
    }

    async fn on_delete_all(&self, feed_id: FeedId, pattern: &str, count: u64) {
        self.events
            .lock()
            .await
            .push(format!("delete_all {feed_id} {pattern} {count}"));
    }
}

pub struct Fixture {
    pub storage: Arc<Repository>,
    pub vendor: Arc<TestVendor>,
    pub sender: Arc<Collect>,
    pub notifier: Arc<Recorder>,
    pub ctx: Arc<TaskContext>,
}

impl Fixture {
    pub async fn new(behavior: Behavior) -> Self {
        Self::build(behavior, false, 3600).await
    }

    pub async fn failing_sender(behavior: Behavior) -> Self {
        Self::build(behavior, true, 3600).await
    }

    /// Tasks poll every `interval_secs`.
    pub async fn polling(behavior: Behavior, interval_secs: u64) -> Self {
        Self::build(behavior, false, interval_secs).await
    }

    async fn build(behavior: Behavior, fail: bool, interval_secs: u64) -> Self {
        let storage = Arc::new(Repository::open_in_memory().await.unwrap());
        let vendor = Arc::new(TestVendor {
            behavior,
            resumed: AtomicUsize::new(0),
        });
        let sender = Arc::new(Collect {
            fail,
            ..Collect::default()
        });
        let notifier = Arc::new(Recorder::default());

        let mut vendors = VendorRegistry::new();
        vendors.register(vendor.clone());

        let ctx = Arc::new(TaskContext {
            storage: storage.clone(),
            vendors: Arc::new(vendors),
            notifier: notifier.clone(),
            metrics: Arc::new(Metrics::new()),
            sender: sender.clone(),
            mediator: Mediator::builder(Client::new(), MediaConfig::default()).build(),
            poll: PollConfig {
                interval_secs,
                ..PollConfig::default()
            },
            page: PageConfig::default(),
        });

        Self {
            storage,
            vendor,
            sender,
            notifier,
            ctx,
        }
    }

    /// Insert an active subscription directly, bypassing the poller.
    pub async fn create(&self, feed_id: FeedId, sub_id: &str) -> Subscription {
        let sub = Subscription::from_draft(
            feed_id,
            "test",
            Draft {
                sub_id: sub_id.to_string(),
                name: format!("Test {sub_id}"),
                data: "\"0\"".to_string(),
            },
        );
        self.storage.create_subscription(&sub).await.unwrap();
        sub
    }

    pub async fn sent_texts(&self) -> Vec<String> {
        self.sender
            .messages
            .lock()
            .await
            .iter()
            .map(|m| m.text.clone())
            .collect()
    }

    pub async fn events(&self) -> Vec<String> {
        self.notifier.events.lock().await.clone()
    }
}
