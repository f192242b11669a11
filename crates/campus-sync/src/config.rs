use std::time::Duration;

use crate::error::{Result, SyncError};

/// Longest message body the client will send, in characters. Matches the
/// backend limit.
pub const DEFAULT_MAX_CONTENT_LEN: usize = 2000;

/// Backoff for read-state writes. Attempt `n` (1-based) waits
/// `base_delay * 2^(n-1)`, capped at `max_delay`, before attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the backend REST API, e.g. `http://localhost:3000`.
    pub api_url: String,
    /// Bearer token for the signed-in student.
    pub token: String,
    pub read_retry: RetryPolicy,
    pub max_content_len: usize,
}

impl SyncConfig {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: token.into(),
            read_retry: RetryPolicy::default(),
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
        }
    }

    /// Read `CAMPUS_API_URL`, `CAMPUS_TOKEN` and the optional
    /// `CAMPUS_READ_RETRY_ATTEMPTS`, loading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let api_url =
            std::env::var("CAMPUS_API_URL").unwrap_or_else(|_| "http://localhost:3000".into());
        let token =
            std::env::var("CAMPUS_TOKEN").map_err(|_| SyncError::Config("CAMPUS_TOKEN"))?;

        let mut config = Self::new(api_url, token);
        if let Ok(raw) = std::env::var("CAMPUS_READ_RETRY_ATTEMPTS") {
            config.read_retry.max_attempts = raw
                .parse()
                .map_err(|_| SyncError::Config("CAMPUS_READ_RETRY_ATTEMPTS"))?;
        }
        Ok(config)
    }

    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }
}
