use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub page: PageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Pause between two refresh cycles of one destination.
    pub interval_secs: u64,
    /// Capacity of the update queue between a refresh and the delivery loop.
    pub preload: usize,
    /// How often `run` re-submits tasks for destinations with active subscriptions.
    pub rescan_secs: u64,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn preload(&self) -> usize {
        self.preload.max(1)
    }

    pub fn rescan(&self) -> Duration {
        Duration::from_secs(self.rescan_secs.max(1))
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            preload: 5,
            rescan_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Number of mediations allowed to run at once.
    pub concurrency: usize,
    /// Smallest size accepted as genuine media, in bytes.
    pub min_size: u64,
    /// Largest attachable size, in bytes.
    pub max_size: u64,
    /// Media up to this size is handed over as a remote link.
    pub remote_max_size: u64,
    pub probe_retries: u32,
    pub probe_backoff_ms: u64,
    pub timeout_secs: u64,
    /// Check buffered media against previously delivered content.
    pub dedup: bool,
    /// Query parameters carrying the real target of a redirector link.
    pub redirect_params: Vec<String>,
    /// Hosts whose links are resolved by following redirects.
    pub redirect_hosts: Vec<String>,
    /// Hosts serving an HTML page around the media instead of the media itself.
    pub page_hosts: Vec<String>,
    pub converters: Vec<ConverterConfig>,
}

impl MediaConfig {
    pub fn probe_backoff(&self) -> Duration {
        Duration::from_millis(self.probe_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            min_size: 10 * 1024,
            max_size: 50 * 1024 * 1024,
            remote_max_size: 20 * 1024 * 1024,
            probe_retries: 3,
            probe_backoff_ms: 1000,
            timeout_secs: 60,
            dedup: true,
            redirect_params: vec!["url".to_string(), "u".to_string()],
            redirect_hosts: vec!["t.co".to_string()],
            page_hosts: Vec::new(),
            converters: Vec::new(),
        }
    }
}

/// Routes media of one MIME type through a conversion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    pub mime: String,
    /// Target URL; `{url}` is replaced with the percent-encoded source URL.
    pub template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    /// Characters per message.
    pub max_text: usize,
    /// Attachments per message.
    pub max_media: usize,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            max_text: 4096,
            max_media: 10,
        }
    }
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feedrelay");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("feeds.db").to_string_lossy().to_string()
}

fn default_user_agent() -> String {
    format!("feedrelay/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            user_agent: default_user_agent(),
            poll: PollConfig::default(),
            media: MediaConfig::default(),
            page: PageConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("feedrelay")
            .join("config.toml")
    }

    fn validate(&self) -> Result<()> {
        // zero would spin the poll loop and time out every request at once
        if self.poll.interval_secs == 0 {
            return Err(AppError::Config("poll.interval_secs must be positive".to_string()));
        }
        let media = &self.media;
        if media.timeout_secs == 0 {
            return Err(AppError::Config("media.timeout_secs must be positive".to_string()));
        }
        if media.min_size > media.max_size {
            return Err(AppError::Config(format!(
                "media.min_size ({}) exceeds media.max_size ({})",
                media.min_size, media.max_size
            )));
        }
        if media.concurrency == 0 {
            return Err(AppError::Config("media.concurrency must be positive".to_string()));
        }
        for converter in &media.converters {
            if !converter.template.contains("{url}") {
                return Err(AppError::Config(format!(
                    "converter for {} has no {{url}} placeholder",
                    converter.mime
                )));
            }
        }
        Ok(())
    }
}
