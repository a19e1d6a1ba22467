use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::models::AnchorPoint;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    pub replay_windows: Vec<ReplayWindow>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
            replay_windows: vec![ReplayWindow::default()],
        }
    }
}

/// Tunables for one replay session's lifecycle.
///
/// Durations are humantime strings ("10s", "500ms") so they can come from a
/// config file or environment unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Automatic retry budget for non-forced failures.
    pub max_retries: u32,
    /// Delay before a failure-triggered setup retry.
    pub retry_delay: String,
    /// How long the session may sit in starting/seeking before a forced failure.
    pub connection_timeout: String,
    /// Rate-limit window for playback-head updates.
    pub head_throttle: String,
    /// Quiet window for coalescing rapid seek requests.
    pub seek_debounce: String,
}

impl SessionConfig {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
    pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_HEAD_THROTTLE: Duration = Duration::from_millis(500);
    pub const DEFAULT_SEEK_DEBOUNCE: Duration = Duration::from_millis(500);

    #[must_use]
    pub fn parse_retry_delay(&self) -> Duration {
        parse_duration_or(&self.retry_delay, Self::DEFAULT_RETRY_DELAY)
    }

    #[must_use]
    pub fn parse_connection_timeout(&self) -> Duration {
        parse_duration_or(&self.connection_timeout, Self::DEFAULT_CONNECTION_TIMEOUT)
    }

    #[must_use]
    pub fn parse_head_throttle(&self) -> Duration {
        parse_duration_or(&self.head_throttle, Self::DEFAULT_HEAD_THROTTLE)
    }

    #[must_use]
    pub fn parse_seek_debounce(&self) -> Duration {
        parse_duration_or(&self.seek_debounce, Self::DEFAULT_SEEK_DEBOUNCE)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            retry_delay: "10s".to_string(),
            connection_timeout: "30s".to_string(),
            head_throttle: "500ms".to_string(),
            seek_debounce: "500ms".to_string(),
        }
    }
}

/// A named replay preset, e.g. "80 seconds ago, 60 second loop".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayWindow {
    pub title: String,
    /// Offset backwards from the live edge where the replay anchors.
    pub seek_back: String,
    /// Duration of the looped playback window.
    pub play_window: String,
}

impl ReplayWindow {
    pub const DEFAULT_SEEK_BACK: Duration = Duration::from_secs(80);
    pub const DEFAULT_PLAY_WINDOW: Duration = Duration::from_secs(60);

    #[must_use]
    pub fn parse_seek_back(&self) -> Duration {
        parse_duration_or(&self.seek_back, Self::DEFAULT_SEEK_BACK)
    }

    #[must_use]
    pub fn parse_play_window(&self) -> Duration {
        parse_duration_or(&self.play_window, Self::DEFAULT_PLAY_WINDOW)
    }

    /// The anchor this preset selects, relative to the live edge.
    #[must_use]
    pub fn anchor(&self) -> AnchorPoint {
        AnchorPoint::BeforeLive(self.parse_seek_back())
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self {
            title: "Recent highlight".to_string(),
            seek_back: "80s".to_string(),
            play_window: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or_else(|e| {
        tracing::warn!(value, error = %e, "Invalid duration in config, using default");
        fallback
    })
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // Load config file if provided
        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (TIMESHIFT_SESSION_MAX_RETRIES, etc.)
        builder = builder.add_source(
            Environment::with_prefix("TIMESHIFT")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for containerized deployments)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }
}
