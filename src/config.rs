//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Tunables for the forwarding pipeline.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// How long a not-ready message waits before it is retried.
    pub deferral_timeout: Duration,
    /// Minimum character count for text-only messages.
    pub min_length: usize,
    /// Maximum character count for text-only messages.
    pub max_length: usize,
    /// Window in which a repeated event key counts as a duplicate.
    pub dedup_window: Duration,
    /// Upper bound on remembered event keys.
    pub dedup_capacity: usize,
    /// How long the album buffer collects members of a media group.
    pub album_timeout: Duration,
    /// Pause between dispatched items. Zero disables pacing.
    pub sequential_delay: Duration,
    /// Minimum gap between two forwards from the same author. Zero disables.
    pub antispam_delay: Duration,
    /// Number of authors the rate limiter remembers.
    pub rate_limiter_capacity: usize,
    /// Pattern applied in addition to a rule's own pattern when the rule opts in.
    pub global_keyword_pattern: String,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            deferral_timeout: Duration::from_millis(5000),
            min_length: 1,
            max_length: 4096,
            dedup_window: Duration::from_secs(10),
            dedup_capacity: 200,
            album_timeout: Duration::from_millis(800),
            sequential_delay: Duration::from_millis(1500),
            antispam_delay: Duration::from_secs(1),
            rate_limiter_capacity: 500,
            global_keyword_pattern: String::new(),
        }
    }
}

impl ForwarderConfig {
    /// Build config from `FORWARDER_*` environment variables.
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let seconds = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(default)
        };
        let count = |key: &str, default: usize| {
            lookup(key)
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(default)
        };

        Self {
            deferral_timeout: millis("FORWARDER_DEFERRAL_TIMEOUT_MS", defaults.deferral_timeout),
            min_length: count("FORWARDER_MIN_MSG_LENGTH", defaults.min_length),
            max_length: count("FORWARDER_MAX_MSG_LENGTH", defaults.max_length),
            dedup_window: seconds("FORWARDER_DEDUP_WINDOW_SECS", defaults.dedup_window),
            dedup_capacity: count("FORWARDER_DEDUP_CAPACITY", defaults.dedup_capacity),
            album_timeout: millis("FORWARDER_ALBUM_TIMEOUT_MS", defaults.album_timeout),
            sequential_delay: seconds(
                "FORWARDER_SEQUENTIAL_DELAY_SECS",
                defaults.sequential_delay,
            ),
            antispam_delay: seconds("FORWARDER_ANTISPAM_DELAY_SECS", defaults.antispam_delay),
            rate_limiter_capacity: count(
                "FORWARDER_RATE_LIMITER_CAPACITY",
                defaults.rate_limiter_capacity,
            ),
            global_keyword_pattern: lookup("FORWARDER_GLOBAL_KEYWORD_PATTERN")
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        }
    }

    /// Reject combinations the pipeline cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_length > self.max_length {
            return Err(ConfigError::InvalidValue {
                key: "FORWARDER_MIN_MSG_LENGTH".into(),
                message: format!(
                    "min length {} exceeds max length {}",
                    self.min_length, self.max_length
                ),
            });
        }
        if self.rate_limiter_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FORWARDER_RATE_LIMITER_CAPACITY".into(),
                message: "capacity must be at least 1".into(),
            });
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FORWARDER_DEDUP_CAPACITY".into(),
                message: "capacity must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Telegram Bot API credentials and polling options.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Long-poll timeout passed to `getUpdates`.
    pub poll_timeout_secs: u64,
}

impl TelegramConfig {
    /// Fails with `MissingEnvVar` when `TELEGRAM_BOT_TOKEN` is unset or blank.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("TELEGRAM_BOT_TOKEN")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;
        let poll_timeout_secs = lookup("TELEGRAM_POLL_TIMEOUT_SECS")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(30);

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            poll_timeout_secs,
        })
    }
}
