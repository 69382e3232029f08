//! Message rendering
//!
//! Vendors write items into a [`Writer`]; the [`Renderer`] splits what they
//! write into pages that fit one chat message each and hands them to a
//! [`Sender`] on flush, after the attached media has been mediated.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::PageConfig;
use crate::error::{AppError, Result};
use crate::media::{MediaRequest, Mediator, PendingMedia};
use crate::models::{FeedId, MediaRef, Mediated};

/// Paginating sink for one rendered item.
pub trait Writer: Send {
    fn text(&mut self, text: &str);

    fn link(&mut self, title: &str, url: &str) {
        self.text(&format!("{title}\n{url}"));
    }

    /// Attach media by URL; mediation starts right away.
    fn media(&mut self, url: &str);

    /// Attach an already started mediation.
    fn attach(&mut self, media: PendingMedia);

    fn page_break(&mut self);
}

/// One outgoing chat message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub text: String,
    pub media: Vec<MediaRef>,
}

/// Delivery into a destination.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, feed_id: FeedId, message: Message) -> Result<()>;

    /// Largest attachment the destination accepts.
    fn max_attach_size(&self, _feed_id: FeedId) -> Option<u64> {
        None
    }
}

/// Prints messages to stdout.
pub struct ConsoleSender;

#[async_trait]
impl Sender for ConsoleSender {
    async fn send(&self, feed_id: FeedId, message: Message) -> Result<()> {
        println!("[{feed_id}] {}", message.text);
        for media in &message.media {
            let metadata = media.metadata();
            match media.path() {
                Some(path) => println!(
                    "[{feed_id}]   {} ({}, {} bytes) at {}",
                    media.url(),
                    metadata.mime_type,
                    metadata.size,
                    path.display()
                ),
                None => println!("[{feed_id}]   {} ({})", media.url(), metadata.mime_type),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Page {
    text: String,
    media: Vec<PendingMedia>,
}

impl Page {
    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.media.is_empty()
    }
}

pub struct Renderer {
    feed_id: FeedId,
    sender: Arc<dyn Sender>,
    mediator: Mediator,
    dedup: bool,
    limits: PageConfig,
    pages: Vec<Page>,
}

impl Renderer {
    pub fn new(feed_id: FeedId, sender: Arc<dyn Sender>, mediator: Mediator, limits: PageConfig) -> Self {
        let dedup = mediator.config().dedup;
        Self {
            feed_id,
            sender,
            mediator,
            dedup,
            limits,
            pages: vec![Page::default()],
        }
    }

    fn current(&mut self) -> &mut Page {
        if self.pages.is_empty() {
            self.pages.push(Page::default());
        }
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    fn push_text(&mut self, text: &str) {
        let max = self.limits.max_text.max(1);
        let mut rest = text;
        while !rest.is_empty() {
            let page = self.current();
            let used = page.text.chars().count();
            let separator = usize::from(!page.text.is_empty());
            let room = max.saturating_sub(used + separator);

            let needed = rest.chars().count();
            if needed <= room {
                if separator == 1 {
                    page.text.push('\n');
                }
                page.text.push_str(rest);
                return;
            }

            if used > 0 {
                self.pages.push(Page::default());
                continue;
            }

            // a single chunk longer than a page: cut at the last line break that fits
            let cut = split_point(rest, max);
            page.text.push_str(&rest[..cut]);
            rest = rest[cut..].trim_start_matches('\n');
            self.pages.push(Page::default());
        }
    }

    /// Resolve media and send every non-empty page.
    pub async fn flush(&mut self, token: &CancellationToken) -> Result<usize> {
        let pages = std::mem::take(&mut self.pages);
        let mut sent = 0;

        for page in pages {
            let mut message = Message {
                text: page.text,
                media: Vec::with_capacity(page.media.len()),
            };

            for pending in page.media {
                let url = pending.url().to_string();
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(AppError::Cancelled),
                    outcome = pending.get() => outcome,
                };
                match outcome {
                    Ok(Mediated::Ready(media)) => message.media.push(media),
                    Ok(Mediated::Duplicate { .. }) => {
                        tracing::debug!(feed_id = self.feed_id, url = %url, "Skipping duplicate media");
                    }
                    Err(e) if e.is_cancellation() => return Err(e),
                    Err(e) => {
                        tracing::warn!(feed_id = self.feed_id, url = %url, "Dropping media: {}", e);
                    }
                }
            }

            if message.text.is_empty() && message.media.is_empty() {
                continue;
            }
            self.sender
                .send(self.feed_id, message)
                .await
                .map_err(|e| match e {
                    AppError::Cancelled => e,
                    other => AppError::Render(format!("delivery failed: {other}")),
                })?;
            sent += 1;
        }

        self.pages.push(Page::default());
        Ok(sent)
    }
}

impl Writer for Renderer {
    fn text(&mut self, text: &str) {
        if !text.is_empty() {
            self.push_text(text);
        }
    }

    fn media(&mut self, url: &str) {
        let request = MediaRequest::new(self.feed_id, url)
            .dedup(self.dedup)
            .max_size(self.sender.max_attach_size(self.feed_id));
        let pending = self.mediator.mediate(request);
        self.attach(pending);
    }

    fn attach(&mut self, media: PendingMedia) {
        let max = self.limits.max_media.max(1);
        if self.current().media.len() >= max {
            self.pages.push(Page::default());
        }
        self.current().media.push(media);
    }

    fn page_break(&mut self) {
        if !self.current().is_empty() {
            self.pages.push(Page::default());
        }
    }
}

/// Byte offset to cut `text` at so that at most `max` chars remain before it,
/// preferring a line break.
fn split_point(text: &str, max: usize) -> usize {
    let hard = text
        .char_indices()
        .nth(max)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    match text[..hard].rfind('\n') {
        Some(i) if i > 0 => i,
        _ => hard,
    }
}
