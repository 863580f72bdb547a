//! Configuration for the client.
//!
//! This module defines the [`ClientConfig`] struct that controls connection
//! behavior, streaming buffers, and the change-feed backoff schedule.
//!
//! # Configuration Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `request_timeout` | 30s | Per-request timeout (non-streaming) |
//! | `connect_timeout` | 10s | Connection establishment timeout |
//! | `pool_max_idle_per_host` | 16 | Idle connections kept per host |
//! | `stream_buffer` | 1 | Decoded-event channel depth (chunks) |
//! | `batch_size` | 100 | `_all_docs` pagination batch size |
//! | `heartbeat` | 10s | Change-feed heartbeat interval |
//! | `correlate_requests` | false | Auto-generate request correlation ids |
//!
//! # Examples
//!
//! ```
//! use couchflow::ClientConfig;
//!
//! let config = ClientConfig::new("http://localhost:5984", "mydb")
//!     .with_credentials("admin", "secret");
//! assert_eq!(config.batch_size, 100);
//! ```

use std::time::Duration;

/// Name of the request-correlation header.
pub const REQUEST_ID_HEADER: &str = "X-Couch-Request-ID";

/// Configuration for a [`CouchClient`](crate::CouchClient) instance.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server base URL, e.g. `http://localhost:5984`.
    pub base_url: String,

    /// Database name all per-database operations target.
    pub database: String,

    /// Basic-auth username. Auth is applied whenever both username and
    /// password are configured.
    pub username: Option<String>,

    /// Basic-auth password.
    pub password: Option<String>,

    /// Timeout for non-streaming requests.
    ///
    /// Streaming requests (views, change feed) are not bounded by this;
    /// the change feed uses the heartbeat watchdog instead.
    pub request_timeout: Duration,

    /// Connection establishment timeout.
    pub connect_timeout: Duration,

    /// Idle connections kept alive per host.
    pub pool_max_idle_per_host: usize,

    /// Depth of the bounded channel carrying decoded events from a feed
    /// task to its consumer. The byte stream is buffered by this many
    /// chunks; 1 gives strict pull-based backpressure.
    pub stream_buffer: usize,

    /// Batch size for the `_all_docs` pagination batcher.
    pub batch_size: usize,

    /// Heartbeat interval requested on the change feed.
    pub heartbeat: Duration,

    /// When set, every request without a caller-supplied correlation id
    /// gets a generated one in [`REQUEST_ID_HEADER`].
    pub correlate_requests: bool,

    /// Change-feed reconnect backoff schedule.
    pub backoff: BackoffConfig,
}

impl ClientConfig {
    /// Create a configuration for the given server and database.
    pub fn new(base_url: impl Into<String>, database: impl Into<String>) -> Self {
        ClientConfig {
            base_url: base_url.into(),
            database: database.into(),
            username: None,
            password: None,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 16,
            stream_buffer: 1,
            batch_size: 100,
            heartbeat: Duration::from_secs(10),
            correlate_requests: false,
            backoff: BackoffConfig::default(),
        }
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, enable: bool) -> Self {
        self.correlate_requests = enable;
        self
    }

    /// True when both halves of the basic-auth pair are present.
    #[inline]
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Exponential backoff schedule for the change-feed subscriber.
///
/// On every non-cancellation failure the subscriber sleeps the current
/// delay, then multiplies it by `factor` (capped at `max_delay`). A
/// successfully decoded change resets the delay to `initial_delay`.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,

    /// Multiplier applied after each consecutive failure.
    pub factor: f64,

    /// Ceiling for the delay.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// The delay that follows `current` in the schedule.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.factor;
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// Fast schedule for tests.
    pub fn testing() -> Self {
        BackoffConfig {
            initial_delay: Duration::from_millis(10),
            factor: 2.0,
            max_delay: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::new("http://localhost:5984", "db");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.stream_buffer, 1);
        assert_eq!(config.heartbeat, Duration::from_secs(10));
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_credentials() {
        let config =
            ClientConfig::new("http://localhost:5984", "db").with_credentials("admin", "pw");
        assert!(config.has_credentials());
    }

    #[test]
    fn test_batch_size_floor() {
        let config = ClientConfig::new("http://h", "db").with_batch_size(0);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_backoff_schedule() {
        let backoff = BackoffConfig::default();
        let d1 = backoff.next_delay(backoff.initial_delay);
        assert_eq!(d1, Duration::from_secs(1));
        let d2 = backoff.next_delay(d1);
        assert_eq!(d2, Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let backoff = BackoffConfig::default();
        let mut delay = backoff.initial_delay;
        for _ in 0..20 {
            delay = backoff.next_delay(delay);
        }
        assert_eq!(delay, backoff.max_delay);
    }
}
