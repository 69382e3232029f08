//! Media mediation
//!
//! Turns a raw media URL into something the delivery layer can attach:
//! resolve, probe metadata, admission control, optional conversion, then
//! either hand over a remote link or download into scratch storage (with an
//! optional uniqueness check). Mediations share one semaphore so media-heavy
//! sources cannot starve HTTP egress for everyone else.

mod converter;
mod hash;
mod probe;
mod resolver;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Client;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::MediaConfig;
use crate::db::HashStore;
use crate::error::{AppError, Result};
use crate::models::{FeedId, MediaHash, MediaRef, Mediated, Metadata};

pub use converter::{Converter, TemplateConverter};
pub use resolver::{PageResolver, RedirectResolver, Resolver};

use hash::content_hash;
use probe::fetch_metadata;

/// Conversions may chain into each other; stop after this many.
const MAX_CONVERSION_DEPTH: usize = 2;

#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub url: String,
    pub feed_id: FeedId,
    /// Check the content against what this destination already received.
    pub dedup: bool,
    /// Always download, even when a remote link would do.
    pub buffer: bool,
    /// Attach limit of the destination, if tighter than the configured one.
    pub max_size: Option<u64>,
}

impl MediaRequest {
    pub fn new(feed_id: FeedId, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            feed_id,
            dedup: false,
            buffer: false,
            max_size: None,
        }
    }

    pub fn dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn buffered(mut self) -> Self {
        self.buffer = true;
        self
    }

    pub fn max_size(mut self, max_size: Option<u64>) -> Self {
        self.max_size = max_size;
        self
    }
}

/// Handle to a mediation running in the background.
pub struct PendingMedia {
    url: String,
    handle: JoinHandle<Result<Mediated>>,
}

impl PendingMedia {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait for the mediation to finish.
    pub async fn get(self) -> Result<Mediated> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(AppError::Cancelled),
            Err(e) => Err(AppError::Media(format!("mediation of {} failed: {}", self.url, e))),
        }
    }
}

impl std::fmt::Debug for PendingMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMedia").field("url", &self.url).finish()
    }
}

pub struct MediatorBuilder {
    client: Client,
    config: MediaConfig,
    resolvers: Vec<Arc<dyn Resolver>>,
    converters: HashMap<String, Arc<dyn Converter>>,
    hashes: Option<Arc<dyn HashStore>>,
    token: CancellationToken,
}

impl MediatorBuilder {
    /// Resolvers are tried in registration order; the first that accepts wins.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn converter(mut self, mime_type: impl Into<String>, converter: Arc<dyn Converter>) -> Self {
        self.converters.insert(mime_type.into(), converter);
        self
    }

    pub fn hash_store(mut self, hashes: Arc<dyn HashStore>) -> Self {
        self.hashes = Some(hashes);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Registers the resolvers and converters named in the configuration.
    pub fn configured(self) -> Self {
        let config = self.config.clone();
        let mut builder = self.resolver(Arc::new(RedirectResolver::new(
            config.redirect_params.clone(),
            config.redirect_hosts.clone(),
        )));
        if !config.page_hosts.is_empty() {
            builder = builder.resolver(Arc::new(PageResolver::new(config.page_hosts.clone())));
        }
        for converter in &config.converters {
            builder = builder.converter(
                converter.mime.clone(),
                Arc::new(TemplateConverter::new(converter.template.clone())),
            );
        }
        builder
    }

    pub fn build(self) -> Mediator {
        let slots = self.config.concurrency.max(1);
        Mediator {
            inner: Arc::new(Inner {
                client: self.client,
                config: self.config,
                semaphore: Semaphore::new(slots),
                resolvers: self.resolvers,
                converters: self.converters,
                hashes: self.hashes,
                token: self.token,
            }),
        }
    }
}

#[derive(Clone)]
pub struct Mediator {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    config: MediaConfig,
    semaphore: Semaphore,
    resolvers: Vec<Arc<dyn Resolver>>,
    converters: HashMap<String, Arc<dyn Converter>>,
    hashes: Option<Arc<dyn HashStore>>,
    token: CancellationToken,
}

impl Mediator {
    pub fn builder(client: Client, config: MediaConfig) -> MediatorBuilder {
        MediatorBuilder {
            client,
            config,
            resolvers: Vec::new(),
            converters: HashMap::new(),
            hashes: None,
            token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.inner.config
    }

    /// Start mediating `request` and return at once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn mediate(&self, request: MediaRequest) -> PendingMedia {
        let inner = Arc::clone(&self.inner);
        let url = request.url.clone();
        let handle = tokio::spawn(async move { inner.run(request).await });
        PendingMedia { url, handle }
    }

    /// Number of mediations that could start right now.
    pub fn available_slots(&self) -> usize {
        self.inner.semaphore.available_permits()
    }
}

impl Inner {
    async fn run(&self, request: MediaRequest) -> Result<Mediated> {
        let _permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(AppError::Cancelled),
            permit = self.semaphore.acquire() => permit.map_err(|_| AppError::Cancelled)?,
        };

        let url = request.url.clone();
        let feed_id = request.feed_id;
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AppError::Cancelled),
            result = tokio::time::timeout(self.config.timeout(), self.pipeline(request, 0)) => {
                result.unwrap_or_else(|_| Err(AppError::Media(format!("mediation of {url} timed out"))))
            }
        };

        match &result {
            Ok(Mediated::Ready(media)) => {
                tracing::debug!(feed_id, url = %url, resolved = media.url(), "Media ready")
            }
            Ok(Mediated::Duplicate { .. }) => {
                tracing::debug!(feed_id, url = %url, "Duplicate media suppressed")
            }
            Err(e) if e.is_cancellation() => {}
            Err(e) => tracing::debug!(feed_id, url = %url, "Mediation failed: {}", e),
        }
        result
    }

    fn pipeline(&self, request: MediaRequest, depth: usize) -> BoxFuture<'_, Result<Mediated>> {
        Box::pin(async move {
            let source = Url::parse(&request.url)?;
            let url = self.resolve(&source).await?;

            let metadata = fetch_metadata(
                &self.client,
                &url,
                self.config.probe_retries,
                self.config.probe_backoff(),
            )
            .await?;

            let ceiling = self.ceiling(&request);
            admit(&metadata, self.config.min_size, ceiling)?;

            if depth < MAX_CONVERSION_DEPTH {
                if let Some(converter) = self.converters.get(&metadata.mime_type) {
                    if let Some(converted) = converter.convert(&self.client, &url, &metadata).await? {
                        tracing::debug!(from = %url, to = %converted, "Converting media");
                        let next = MediaRequest {
                            url: converted.to_string(),
                            ..request
                        };
                        return self.pipeline(next, depth + 1).await;
                    }
                }
            }

            let remote = metadata
                .known_size()
                .is_some_and(|size| size <= self.config.remote_max_size);
            if remote && !request.dedup && !request.buffer {
                return Ok(Mediated::Ready(MediaRef::Remote {
                    url: url.to_string(),
                    metadata,
                }));
            }

            self.download(&request, url, metadata, ceiling).await
        })
    }

    async fn resolve(&self, url: &Url) -> Result<Url> {
        match self.resolvers.iter().find(|r| r.accepts(url)) {
            Some(resolver) => resolver.resolve(&self.client, url).await,
            None => Ok(url.clone()),
        }
    }

    fn ceiling(&self, request: &MediaRequest) -> u64 {
        match request.max_size {
            Some(limit) => limit.min(self.config.max_size),
            None => self.config.max_size,
        }
    }

    async fn download(
        &self,
        request: &MediaRequest,
        url: Url,
        metadata: Metadata,
        ceiling: u64,
    ) -> Result<Mediated> {
        let mut response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(AppError::status(response.status(), url.as_str()));
        }

        let scratch = NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(scratch.reopen()?);
        let mut counted: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            counted += chunk.len() as u64;
            if counted > ceiling {
                return Err(AppError::Rejected(format!(
                    "{url} is too large: more than {ceiling} bytes"
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if metadata.known_size().is_none() && counted < self.config.min_size {
            return Err(AppError::Rejected(format!(
                "{url} is too small: {counted} bytes"
            )));
        }

        let metadata = Metadata {
            size: counted as i64,
            ..metadata
        };

        if request.dedup {
            let hashes = self.hashes.as_ref().ok_or_else(|| {
                AppError::Unsupported("deduplication without a hash store".to_string())
            })?;

            let path = scratch.path().to_path_buf();
            let mime_type = metadata.mime_type.clone();
            let (hash_type, hash_value) =
                tokio::task::spawn_blocking(move || content_hash(&path, &mime_type))
                    .await
                    .map_err(|e| AppError::Media(format!("hashing failed: {e}")))??;

            let stored = hashes
                .check_unique(&MediaHash::new(request.feed_id, url.as_str(), hash_type, hash_value))
                .await?;
            if !stored.is_unique() {
                tracing::debug!(
                    feed_id = request.feed_id,
                    url = %url,
                    collisions = stored.collisions,
                    "Media seen before"
                );
                return Ok(Mediated::Duplicate {
                    url: url.to_string(),
                });
            }
        }

        Ok(Mediated::Ready(MediaRef::Buffered {
            url: url.to_string(),
            metadata,
            file: Arc::new(scratch),
        }))
    }
}

/// Size gate applied before anything is downloaded. Unknown sizes pass.
pub fn admit(metadata: &Metadata, floor: u64, ceiling: u64) -> Result<()> {
    let Some(size) = metadata.known_size() else {
        return Ok(());
    };
    if size < floor {
        return Err(AppError::Rejected(format!(
            "too small: {size} bytes, at least {floor} expected"
        )));
    }
    if size > ceiling {
        return Err(AppError::Rejected(format!(
            "too large: {size} bytes, at most {ceiling} allowed"
        )));
    }
    Ok(())
}
