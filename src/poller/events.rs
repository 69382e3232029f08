//! Lifecycle notifications.

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{FeedId, Subscription};
use crate::render::{Message, Sender};

/// Observer of subscription transitions. Invoked once per transition.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn on_resume(&self, sub: &Subscription);

    async fn on_suspend(&self, sub: &Subscription);

    async fn on_delete(&self, sub: &Subscription);

    async fn on_delete_all(&self, feed_id: FeedId, pattern: &str, count: u64);
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn on_resume(&self, sub: &Subscription) {
        tracing::info!(sub = %sub.header, name = %sub.name, "Subscription active");
    }

    async fn on_suspend(&self, sub: &Subscription) {
        tracing::info!(
            sub = %sub.header,
            name = %sub.name,
            reason = sub.error.as_deref().unwrap_or_default(),
            "Subscription suspended"
        );
    }

    async fn on_delete(&self, sub: &Subscription) {
        tracing::info!(sub = %sub.header, name = %sub.name, "Subscription deleted");
    }

    async fn on_delete_all(&self, feed_id: FeedId, pattern: &str, count: u64) {
        tracing::info!(feed_id, pattern, count, "Subscriptions cleared");
    }
}

/// Reports transitions to the destination itself.
pub struct ChatNotifier {
    sender: Arc<dyn Sender>,
}

impl ChatNotifier {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self { sender }
    }

    async fn say(&self, feed_id: FeedId, text: String) {
        let message = Message {
            text,
            media: Vec::new(),
        };
        if let Err(e) = self.sender.send(feed_id, message).await {
            tracing::warn!(feed_id, "Notification not delivered: {}", e);
        }
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn on_resume(&self, sub: &Subscription) {
        self.say(sub.header.feed_id, format!("Subscribed to {} ({})", sub.name, sub.header.vendor))
            .await;
    }

    async fn on_suspend(&self, sub: &Subscription) {
        let reason = sub.error.as_deref().unwrap_or("unknown reason");
        self.say(sub.header.feed_id, format!("Suspended {}: {}", sub.name, reason))
            .await;
    }

    async fn on_delete(&self, sub: &Subscription) {
        self.say(sub.header.feed_id, format!("Deleted {}", sub.name)).await;
    }

    async fn on_delete_all(&self, feed_id: FeedId, pattern: &str, count: u64) {
        self.say(feed_id, format!("Deleted {count} suspended subscriptions matching {pattern}"))
            .await;
    }
}

/// Fans out to several notifiers in order.
#[derive(Default)]
pub struct Notifiers(Vec<Arc<dyn Notifier>>);

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.0.push(notifier);
        self
    }
}

#[async_trait]
impl Notifier for Notifiers {
    async fn on_resume(&self, sub: &Subscription) {
        for n in &self.0 {
            n.on_resume(sub).await;
        }
    }

    async fn on_suspend(&self, sub: &Subscription) {
        for n in &self.0 {
            n.on_suspend(sub).await;
        }
    }

    async fn on_delete(&self, sub: &Subscription) {
        for n in &self.0 {
            n.on_delete(sub).await;
        }
    }

    async fn on_delete_all(&self, feed_id: FeedId, pattern: &str, count: u64) {
        for n in &self.0 {
            n.on_delete_all(feed_id, pattern, count).await;
        }
    }
}
