use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::FeedId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub mime_type: String,
    /// Content length in bytes, negative when unknown.
    pub size: i64,
}

impl Metadata {
    pub fn known_size(&self) -> Option<u64> {
        u64::try_from(self.size).ok().filter(|size| *size > 0)
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// A deliverable media reference.
#[derive(Debug, Clone)]
pub enum MediaRef {
    /// The delivery layer fetches the URL itself.
    Remote { url: String, metadata: Metadata },
    /// Content already downloaded into scratch storage.
    Buffered {
        url: String,
        metadata: Metadata,
        file: Arc<NamedTempFile>,
    },
}

impl MediaRef {
    pub fn url(&self) -> &str {
        match self {
            MediaRef::Remote { url, .. } | MediaRef::Buffered { url, .. } => url,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            MediaRef::Remote { metadata, .. } | MediaRef::Buffered { metadata, .. } => metadata,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            MediaRef::Remote { .. } => None,
            MediaRef::Buffered { file, .. } => Some(file.path()),
        }
    }
}

/// Result of a successful mediation.
#[derive(Debug, Clone)]
pub enum Mediated {
    Ready(MediaRef),
    /// The content was already delivered to this destination; suppress it.
    Duplicate { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashType {
    /// Perceptual difference hash of a decoded image.
    DHash,
    Sha256,
}

impl HashType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashType::DHash => "dhash",
            HashType::Sha256 => "sha256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dhash" => Some(HashType::DHash),
            "sha256" => Some(HashType::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaHash {
    pub feed_id: FeedId,
    pub url: String,
    pub hash_type: HashType,
    pub hash_value: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub collisions: i64,
}

impl MediaHash {
    pub fn new(feed_id: FeedId, url: impl Into<String>, hash_type: HashType, hash_value: String) -> Self {
        let now = Utc::now();
        Self {
            feed_id,
            url: url.into(),
            hash_type,
            hash_value,
            first_seen: now,
            last_seen: now,
            collisions: 0,
        }
    }

    pub fn is_unique(&self) -> bool {
        self.collisions == 0
    }
}
