//! Configuration types for path watching.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Configuration shared by all watchers a factory creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Which notification backend to use.
    pub backend: Backend,

    /// Scan interval of the poll backend, in milliseconds.
    pub poll_interval_ms: u64,

    /// Whether recursive watchers may rely on the backend's own recursion.
    ///
    /// When disabled, recursive watchers always walk the tree and register
    /// every directory individually.
    pub prefer_native_recursion: bool,
}

impl WatcherConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self {
            backend: Backend::default(),
            poll_interval_ms: 100,
            prefer_native_recursion: true,
        }
    }

    /// Set the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Never use backend-native recursion.
    pub fn without_native_recursion(mut self) -> Self {
        self.prefer_native_recursion = false;
        self
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the configuration for values no backend can honor.
    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::Poll && self.poll_interval_ms == 0 {
            return Err(WatcherError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of raw change notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// The platform's native notification API (inotify, FSEvents, kqueue,
    /// ReadDirectoryChangesW).
    #[default]
    Native,

    /// Periodic scanning. Use this for network file systems or wherever
    /// native notifications are unreliable.
    Poll,
}

impl Backend {
    /// Whether registering a directory with this backend can cover its whole
    /// subtree without registering each descendant.
    pub fn supports_native_recursion(self) -> bool {
        match self {
            Backend::Native => cfg!(any(target_os = "windows", target_os = "macos")),
            Backend::Poll => true,
        }
    }
}

impl FromStr for Backend {
    type Err = WatcherError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" => Ok(Backend::Native),
            "poll" | "polling" => Ok(Backend::Poll),
            _ => Err(WatcherError::Config(format!(
                "invalid backend '{s}'. Valid options: native, poll"
            ))),
        }
    }
}
