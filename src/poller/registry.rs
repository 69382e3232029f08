//! Single-flight task registry
//!
//! At most one task runs per key. Submitting for a key that already has a live
//! task is a no-op. A task that runs out of work leaves through [`TaskRegistry::retire`]
//! so a submit racing with its exit is never swallowed.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TaskEntry {
    generation: u64,
    token: CancellationToken,
    /// Taken by `cancel` while it waits for the task to stop.
    join: Option<JoinHandle<()>>,
}

impl TaskEntry {
    fn is_live(&self) -> bool {
        match &self.join {
            Some(join) => !join.is_finished(),
            // being cancelled right now
            None => true,
        }
    }
}

pub struct TaskRegistry<K> {
    tasks: RwLock<HashMap<K, TaskEntry>>,
    generation: AtomicU64,
    root: CancellationToken,
}

impl<K> TaskRegistry<K>
where
    K: Eq + Hash + Clone + std::fmt::Display + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            root: CancellationToken::new(),
        }
    }

    /// Start `task` for `key` unless a task for it is already registered.
    ///
    /// `task` receives its cancellation token and its generation, which
    /// identifies it to [`TaskRegistry::retire`]. Returns `true` when a new task
    /// was started.
    pub async fn submit<F, Fut>(&self, key: K, task: F) -> bool
    where
        F: FnOnce(CancellationToken, u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.write().await;

        if tasks.get(&key).is_some_and(TaskEntry::is_live) {
            tracing::trace!(key = %key, "Task already running");
            return false;
        }

        if self.root.is_cancelled() {
            tracing::debug!(key = %key, "Registry closed, task not started");
            return false;
        }

        let token = self.root.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(task(token.clone(), generation));

        tasks.insert(
            key.clone(),
            TaskEntry {
                generation,
                token,
                join: Some(join),
            },
        );

        tracing::debug!(key = %key, generation, "Task started");
        true
    }

    /// Cancel the task for `key` and wait until it has stopped.
    pub async fn cancel(&self, key: &K) {
        let (generation, token, join) = {
            let mut tasks = self.tasks.write().await;
            let Some(entry) = tasks.get_mut(key) else {
                return;
            };
            let Some(join) = entry.join.take() else {
                // another caller is already waiting for this task
                return;
            };
            (entry.generation, entry.token.clone(), join)
        };

        token.cancel();
        if let Err(e) = join.await {
            if e.is_panic() {
                tracing::error!(key = %key, "Task panicked: {}", e);
            }
        }

        let mut tasks = self.tasks.write().await;
        if tasks.get(key).is_some_and(|e| e.generation == generation) {
            tasks.remove(key);
        }

        tracing::debug!(key = %key, generation, "Task stopped");
    }

    /// Deregister the task `generation` of `key` if `idle` confirms it has
    /// nothing left to do.
    ///
    /// `idle` runs under the registry lock: a concurrent submit either lands
    /// before the check, and `idle` sees its work, or after the entry is gone
    /// and starts a fresh task. Returns `true` when the caller should exit.
    pub async fn retire<F, Fut>(&self, key: &K, generation: u64, idle: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut tasks = self.tasks.write().await;
        if !idle().await {
            return false;
        }
        if tasks.get(key).is_some_and(|e| e.generation == generation) {
            tasks.remove(key);
            tracing::debug!(key = %key, generation, "Task retired");
        }
        true
    }

    /// Cancel every registered task and wait for all of them.
    pub async fn close(&self) {
        self.root.cancel();
        let keys = self.keys().await;
        futures::future::join_all(keys.iter().map(|key| self.cancel(key))).await;
    }

    pub async fn is_running(&self, key: &K) -> bool {
        self.tasks
            .read()
            .await
            .get(key)
            .is_some_and(TaskEntry::is_live)
    }

    pub async fn keys(&self) -> Vec<K> {
        self.tasks.read().await.keys().cloned().collect()
    }

    /// Number of live tasks.
    pub async fn len(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|e| e.is_live())
            .count()
    }
}

impl<K> Default for TaskRegistry<K>
where
    K: Eq + Hash + Clone + std::fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_submits_start_one_task() {
        let registry = Arc::new(TaskRegistry::<i64>::new());
        let started = Arc::new(AtomicUsize::new(0));

        let submits = (0..32).map(|_| {
            let registry = registry.clone();
            let started = started.clone();
            tokio::spawn(async move {
                registry
                    .submit(1, move |token, _| async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        token.cancelled().await;
                    })
                    .await
            })
        });
        let results = futures::future::join_all(submits).await;

        let accepted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(accepted, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len().await, 1);

        registry.close().await;
    }

    #[tokio::test]
    async fn cancel_waits_for_the_task_to_stop() {
        let registry = TaskRegistry::<i64>::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        let flag = stopped.clone();

        registry
            .submit(7, move |token, _| async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(30)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        registry.cancel(&7).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(!registry.is_running(&7).await);
        assert!(registry.keys().await.is_empty());

        // cancelling an absent key is a no-op
        registry.cancel(&7).await;
    }

    #[tokio::test]
    async fn finished_task_can_be_resubmitted() {
        let registry = TaskRegistry::<i64>::new();
        assert!(registry.submit(3, |_, _| async {}).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!registry.is_running(&3).await);
        assert!(registry.submit(3, |token, _| async move { token.cancelled().await }).await);
        assert!(registry.is_running(&3).await);
        registry.close().await;
    }

    #[tokio::test]
    async fn closed_registry_rejects_new_tasks() {
        let registry = TaskRegistry::<i64>::new();
        registry
            .submit(1, |token, _| async move { token.cancelled().await })
            .await;
        registry.submit(2, |token, _| async move { token.cancelled().await }).await;
        assert_eq!(registry.len().await, 2);

        registry.close().await;
        assert_eq!(registry.len().await, 0);
        assert!(!registry.submit(1, |_, _| async {}).await);
    }

    #[tokio::test]
    async fn retire_keeps_the_entry_while_work_remains() {
        let registry = TaskRegistry::<i64>::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        registry
            .submit(5, move |token, generation| {
                let _ = tx.send(generation);
                async move { token.cancelled().await }
            })
            .await;
        let generation = rx.await.unwrap();

        assert!(!registry.retire(&5, generation, || async { false }).await);
        assert!(registry.is_running(&5).await);

        assert!(registry.retire(&5, generation, || async { true }).await);
        assert!(registry.keys().await.is_empty());
        registry.close().await;
    }

    #[tokio::test]
    async fn submit_during_retire_starts_a_fresh_task() {
        let registry = Arc::new(TaskRegistry::<i64>::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        registry
            .submit(9, move |token, generation| {
                let _ = tx.send(generation);
                async move { token.cancelled().await }
            })
            .await;
        let generation = rx.await.unwrap();

        // the old task decides to leave while a resume submits concurrently
        let leaving = registry.clone();
        let retire = tokio::spawn(async move {
            leaving
                .retire(&9, generation, || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    true
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = registry
            .submit(9, |token, _| async move { token.cancelled().await })
            .await;

        assert!(retire.await.unwrap());
        assert!(started, "submit racing an exit must not be dropped");
        assert!(registry.is_running(&9).await);
        registry.close().await;
    }

    #[tokio::test]
    async fn stale_generation_does_not_remove_a_newer_task() {
        let registry = TaskRegistry::<i64>::new();
        registry
            .submit(4, |token, _| async move { token.cancelled().await })
            .await;

        assert!(registry.retire(&4, u64::MAX, || async { true }).await);
        assert!(registry.is_running(&4).await);
        registry.close().await;
    }
}
