//! In-memory counters per destination and vendor.
//!
//! Purely observational; nothing reads them to make decisions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::models::FeedId;

#[derive(Debug, Default)]
pub struct Counters {
    /// Items rendered and persisted
    pub updates: AtomicU64,
    /// Cycles ending in an error
    pub failures: AtomicU64,
    /// Suspensions caused by refresh errors
    pub suspends: AtomicU64,
    /// Cycles without any new item
    pub heartbeats: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub updates: u64,
    pub failures: u64,
    pub suspends: u64,
    pub heartbeats: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            updates: self.updates.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            suspends: self.suspends.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    counters: RwLock<HashMap<(FeedId, String), Arc<Counters>>>,
    running_tasks: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self, feed_id: FeedId, vendor: &str) -> Arc<Counters> {
        let key = (feed_id, vendor.to_string());
        if let Some(counters) = self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return counters.clone();
        }
        self.counters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .clone()
    }

    pub fn snapshot(&self, feed_id: FeedId, vendor: &str) -> CountersSnapshot {
        self.counters(feed_id, vendor).snapshot()
    }

    pub fn all(&self) -> Vec<((FeedId, String), CountersSnapshot)> {
        let mut all: Vec<_> = self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(key, counters)| (key.clone(), counters.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn task_started(&self) {
        self.running_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_stopped(&self) {
        self.running_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn running_tasks(&self) -> u64 {
        self.running_tasks.load(Ordering::Relaxed)
    }
}
