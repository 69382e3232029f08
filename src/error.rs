use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    Exists,

    #[error("no vendor accepts {0}")]
    NoMatchingVendor(String),

    #[error("suspended by user")]
    UserSuspended,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("cancelled")]
    Cancelled,

    /// Admission control rejected a single media item.
    #[error("media rejected: {0}")]
    Rejected(String),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Vendor error: {0}")]
    Vendor(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Feed parse error: {0}")]
    FeedParse(#[from] feed_rs::parser::ParseFeedError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Cancellation unwinds the caller; it is never persisted or reported as a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    /// Errors worth retrying on the next scheduled cycle instead of suspending.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http(e) => {
                if let Some(status) = e.status() {
                    return status_is_transient(status.as_u16());
                }
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            AppError::HttpStatus { status, .. } => status_is_transient(*status),
            AppError::Io(_) => true,
            _ => false,
        }
    }

    pub fn status(status: reqwest::StatusCode, url: impl Into<String>) -> Self {
        AppError::HttpStatus {
            status: status.as_u16(),
            url: url.into(),
        }
    }
}

fn status_is_transient(status: u16) -> bool {
    match status {
        401 | 403 => false,
        400..=599 => true,
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
