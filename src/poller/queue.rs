//! Bounded hand-off between a vendor refresh and the poll loop.
//!
//! The producer side ([`UpdateSink`]) is owned by the task running
//! `Vendor::refresh`; the queue closes when that task drops the sink, which
//! happens exactly once however the refresh ends. Errors and panics inside the
//! refresh are turned into a terminal [`Update::Failed`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::Header;
use crate::render::Writer;
use crate::vendor::Vendor;

/// Renders one item into the destination's writer.
pub type RenderFn = Box<dyn FnOnce(&mut dyn Writer) -> Result<()> + Send>;

pub enum Update {
    /// A candidate item. `render` is `None` when only the state advances.
    Item { render: Option<RenderFn>, data: String },
    /// Terminal error; nothing follows it.
    Failed(AppError),
}

impl std::fmt::Debug for Update {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Update::Item { render, data } => f
                .debug_struct("Item")
                .field("render", &render.is_some())
                .field("data", data)
                .finish(),
            Update::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Producer half of the update queue.
pub struct UpdateSink {
    tx: mpsc::Sender<Update>,
    data: String,
    token: CancellationToken,
    failed: bool,
}

impl UpdateSink {
    /// Decode the persisted vendor state. Empty state decodes to the default.
    pub fn init<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        if self.data.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&self.data)?)
    }

    /// Forward an item, waiting while the queue is full.
    pub async fn submit<T>(&mut self, render: Option<RenderFn>, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        if self.failed {
            return Err(AppError::Vendor("update queue already failed".to_string()));
        }
        let data = serde_json::to_string(data)?;
        self.send(Update::Item { render, data }).await
    }

    /// Terminate the refresh with an error. Only the first call is forwarded.
    pub async fn cancel(&mut self, err: AppError) -> Result<()> {
        if self.failed {
            return Ok(());
        }
        self.failed = true;
        self.send(Update::Failed(err)).await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    async fn send(&self, update: Update) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AppError::Cancelled),
            sent = self.tx.send(update) => sent.map_err(|_| AppError::Cancelled),
        }
    }
}

/// Consumer half of the update queue.
pub struct UpdateStream {
    rx: mpsc::Receiver<Update>,
    token: CancellationToken,
}

impl UpdateStream {
    /// Next update, or `None` once the producer has closed the queue.
    pub async fn next(&mut self) -> Result<Option<Update>> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AppError::Cancelled),
            update = self.rx.recv() => Ok(update),
        }
    }
}

impl Drop for UpdateStream {
    fn drop(&mut self) {
        // unblocks a producer still waiting on a full queue
        self.token.cancel();
    }
}

/// Open a queue of `capacity` slots seeded with the persisted `data`.
pub fn channel(data: String, capacity: usize, parent: &CancellationToken) -> (UpdateSink, UpdateStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let token = parent.child_token();
    let sink = UpdateSink {
        tx,
        data,
        token: token.clone(),
        failed: false,
    };
    (sink, UpdateStream { rx, token })
}

/// Run `vendor.refresh` as a concurrent producer and return the consumer side.
pub fn spawn_refresh(
    vendor: Arc<dyn Vendor>,
    header: Header,
    data: String,
    capacity: usize,
    parent: &CancellationToken,
) -> UpdateStream {
    let (mut sink, stream) = channel(data, capacity, parent);

    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(vendor.refresh(&header, &mut sink))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => {
                tracing::error!(sub = %header, "Refresh panicked: {}", panic_message(&*panic));
                Some(AppError::Vendor(format!(
                    "refresh panicked: {}",
                    panic_message(&*panic)
                )))
            }
        };

        if let Some(err) = failure {
            if let Err(e) = sink.cancel(err).await {
                tracing::debug!(sub = %header, "Failure not delivered: {}", e);
            }
        }
        // dropping the sink closes the queue
    });

    stream
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::models::Draft;
    use crate::vendor::SubscribeOptions;

    #[derive(Debug, Default, serde::Deserialize, PartialEq)]
    struct State {
        seen: Vec<String>,
    }

    #[tokio::test]
    async fn init_decodes_prior_state() {
        let token = CancellationToken::new();
        let (sink, _stream) = channel(r#"{"seen":["a"]}"#.to_string(), 1, &token);
        let state: State = sink.init().unwrap();
        assert_eq!(state.seen, vec!["a".to_string()]);

        let (sink, _stream) = channel(String::new(), 1, &token);
        assert_eq!(sink.init::<State>().unwrap(), State::default());
    }

    #[tokio::test]
    async fn full_queue_blocks_until_drained() {
        const CAPACITY: usize = 3;
        let token = CancellationToken::new();
        let (mut sink, mut stream) = channel(String::new(), CAPACITY, &token);
        let submitted = Arc::new(AtomicUsize::new(0));

        let counter = submitted.clone();
        let producer = tokio::spawn(async move {
            for i in 0..=CAPACITY {
                sink.submit(None, &i).await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(submitted.load(Ordering::SeqCst), CAPACITY);

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, Update::Item { ref data, .. } if data == "0"));

        producer.await.unwrap();
        assert_eq!(submitted.load(Ordering::SeqCst), CAPACITY + 1);

        let mut rest = 0;
        while let Some(update) = stream.next().await.unwrap() {
            assert!(matches!(update, Update::Item { .. }));
            rest += 1;
        }
        assert_eq!(rest, CAPACITY);
    }

    #[tokio::test]
    async fn cancellation_unblocks_pending_submit() {
        let token = CancellationToken::new();
        let (mut sink, stream) = channel(String::new(), 1, &token);
        sink.submit(None, "first").await.unwrap();

        let blocked = tokio::spawn(async move { sink.submit(None, "second").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let err = blocked.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        drop(stream);
    }

    #[tokio::test]
    async fn only_first_cancel_is_forwarded() {
        let token = CancellationToken::new();
        let (mut sink, mut stream) = channel(String::new(), 4, &token);
        sink.cancel(AppError::Vendor("first".into())).await.unwrap();
        sink.cancel(AppError::Vendor("second".into())).await.unwrap();
        assert!(sink.submit(None, "late").await.is_err());
        drop(sink);

        let update = stream.next().await.unwrap().unwrap();
        assert!(matches!(update, Update::Failed(AppError::Vendor(ref m)) if m == "first"));
        assert!(stream.next().await.unwrap().is_none());
    }

    struct Panicking;

    #[async_trait]
    impl Vendor for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn parse(&self, _reference: &str, _options: &SubscribeOptions) -> Result<Option<Draft>> {
            Ok(None)
        }

        async fn refresh(&self, _header: &Header, queue: &mut UpdateSink) -> Result<()> {
            queue.submit(None, "before").await?;
            panic!("scraper exploded");
        }
    }

    #[tokio::test]
    async fn panicking_refresh_becomes_terminal_failure() {
        let token = CancellationToken::new();
        let mut stream = spawn_refresh(
            Arc::new(Panicking),
            Header::new(1, "panicking", "x"),
            String::new(),
            2,
            &token,
        );

        assert!(matches!(stream.next().await.unwrap(), Some(Update::Item { .. })));
        match stream.next().await.unwrap() {
            Some(Update::Failed(AppError::Vendor(msg))) => assert!(msg.contains("scraper exploded")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.next().await.unwrap().is_none());
    }
}
