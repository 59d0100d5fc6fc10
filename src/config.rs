use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ReaderError;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Tunables for one run. Immutable once the banner is printed.
#[derive(Debug, Clone)]
pub struct ReadConfig {
    /// Base pause between batches, milliseconds.
    pub base_delay: u64,
    /// Uniform random extra added to `base_delay`, milliseconds.
    pub random_delay_range: u64,
    /// Smallest number of posts per timings request.
    pub min_req_size: u32,
    /// Largest number of posts per timings request.
    pub max_req_size: u32,
    /// Per-post dwell bounds, milliseconds.
    pub min_read_time: u32,
    pub max_read_time: u32,
    /// Resume from the server-side read cursor instead of post 1.
    pub start_from_current: bool,
    /// Retries per batch after the first attempt.
    pub retry_count: u32,
    /// Pause between topics in --all-new mode, milliseconds.
    pub topic_delay: u64,
    pub user_agent: String,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            base_delay: 2500,
            random_delay_range: 800,
            min_req_size: 8,
            max_req_size: 20,
            min_read_time: 800,
            max_read_time: 3000,
            start_from_current: false,
            retry_count: 3,
            topic_delay: 1500,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ReadConfig {
    /// Rejects nonsensical sizing before any network activity.
    pub fn validate(&self) -> Result<(), ReaderError> {
        if self.min_req_size == 0 || self.min_req_size > self.max_req_size {
            return Err(ReaderError::Config {
                min: self.min_req_size,
                max: self.max_req_size,
            });
        }
        if self.min_read_time == 0 || self.min_read_time > self.max_read_time {
            return Err(ReaderError::DwellConfig {
                min: self.min_read_time,
                max: self.max_read_time,
            });
        }
        Ok(())
    }
}

/// Optional TOML overlay (`--config ldreader.toml`). Every field optional,
/// missing fields keep their defaults; CLI flags win over the file.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub base_delay: Option<u64>,
    pub random_delay_range: Option<u64>,
    pub min_req_size: Option<u32>,
    pub max_req_size: Option<u32>,
    pub min_read_time: Option<u32>,
    pub max_read_time: Option<u32>,
    pub start_from_current: Option<bool>,
    pub retry_count: Option<u32>,
    pub topic_delay: Option<u64>,
    pub user_agent: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn apply(&self, config: &mut ReadConfig) {
        if let Some(v) = self.base_delay {
            config.base_delay = v;
        }
        if let Some(v) = self.random_delay_range {
            config.random_delay_range = v;
        }
        if let Some(v) = self.min_req_size {
            config.min_req_size = v;
        }
        if let Some(v) = self.max_req_size {
            config.max_req_size = v;
        }
        if let Some(v) = self.min_read_time {
            config.min_read_time = v;
        }
        if let Some(v) = self.max_read_time {
            config.max_read_time = v;
        }
        if let Some(v) = self.start_from_current {
            config.start_from_current = v;
        }
        if let Some(v) = self.retry_count {
            config.retry_count = v;
        }
        if let Some(v) = self.topic_delay {
            config.topic_delay = v;
        }
        if let Some(v) = &self.user_agent {
            config.user_agent = v.clone();
        }
    }
}
