use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a delivery destination (a chat).
pub type FeedId = i64;

/// Natural key of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    pub sub_id: String,
    pub vendor: String,
    pub feed_id: FeedId,
}

impl Header {
    pub fn new(feed_id: FeedId, vendor: impl Into<String>, sub_id: impl Into<String>) -> Self {
        Self {
            sub_id: sub_id.into(),
            vendor: vendor.into(),
            feed_id,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.vendor, self.sub_id, self.feed_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub header: Header,
    pub name: String,
    /// Vendor state, serialized. Never inspected outside the owning vendor.
    pub data: String,
    pub updated_at: Option<DateTime<Utc>>,
    /// Suspend reason; `None` means the subscription is active.
    pub error: Option<String>,
}

impl Subscription {
    pub fn from_draft(feed_id: FeedId, vendor: &str, draft: Draft) -> Self {
        Self {
            header: Header::new(feed_id, vendor, draft.sub_id),
            name: draft.name,
            data: draft.data,
            updated_at: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.error.is_none()
    }
}

/// Parsed subscribe request, before it is bound to a destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub sub_id: String,
    pub name: String,
    pub data: String,
}

impl Draft {
    pub fn is_empty(&self) -> bool {
        self.sub_id.is_empty()
    }
}

/// Guarded write applied by `Storage::update_subscription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionValue {
    /// Clear the error. Requires the subscription to be suspended.
    Resume,
    /// Replace the data and touch `updated_at`. Requires the subscription to be active.
    Data(String),
    /// Record a suspend reason. Requires the subscription to be active.
    Error(String),
}
