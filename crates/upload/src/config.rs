//! Upload policy configuration.
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! concurrency = 8
//! chunk_size = 8388608
//!
//! [retry]
//! initial_delay_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors loading an [`UploadPolicy`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Exponential backoff between retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
    /// Multiplier per attempt.
    pub backoff_factor: f64,
    /// Fraction of each delay randomised in either direction (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 15_000,
            backoff_factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Tunables for upload sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    /// Concurrent chunk uploads, before the backend's own cap.
    pub concurrency: usize,
    /// Attempts per chunk, including the first.
    pub chunk_attempts: u32,
    pub retry: RetryPolicy,
    /// Refresh credentials this long before they would expire mid-request.
    pub refresh_margin_secs: u64,
    /// Assumed duration of one chunk request until throughput is measured.
    pub expected_chunk_secs: u64,
    /// Fast-path challenges answered before falling back to a full upload.
    pub max_challenges: u32,
    /// "Still assembling" answers tolerated before giving up.
    pub finalize_polls: u32,
    /// Base delay between finalize polls when the backend gives no hint.
    pub finalize_poll_ms: u64,
    /// Ceiling on a whole session, including finalize polling.
    pub session_timeout_secs: Option<u64>,
    /// Where non-seekable sources are spooled; the system temp dir if unset.
    pub spool_dir: Option<PathBuf>,
    /// Preferred chunk size, overriding the backend's.
    pub chunk_size: Option<u64>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            concurrency: 4,
            chunk_attempts: 3,
            retry: RetryPolicy::default(),
            refresh_margin_secs: 30,
            expected_chunk_secs: 60,
            max_challenges: 3,
            finalize_polls: 30,
            finalize_poll_ms: 500,
            session_timeout_secs: None,
            spool_dir: None,
            chunk_size: None,
        }
    }
}

impl UploadPolicy {
    /// Parses a policy from TOML.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let policy: Self = toml::from_str(s)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Loads a policy file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no upload policy file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let policy = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "upload policy loaded");
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.chunk_attempts == 0 {
            return Err(ConfigError::Invalid(
                "chunk_attempts must be at least 1".into(),
            ));
        }
        if self.chunk_size == Some(0) {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if !(self.retry.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.backoff_factor must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(
                "retry.jitter must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn expected_chunk_duration(&self) -> Duration {
        Duration::from_secs(self.expected_chunk_secs)
    }

    pub fn finalize_poll_interval(&self) -> Duration {
        Duration::from_millis(self.finalize_poll_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs.map(Duration::from_secs)
    }
}
