//! Configuration for the sync engine.

use rand::Rng;
use serde_json::{Map, Value};
use std::time::Duration;

/// Which transport carries the sync stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Chunked HTTP POST carrying newline-delimited JSON.
    #[default]
    Http,
    /// Credit-based socket transport carrying CBOR frames.
    Socket,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry configuration for failed iterations and uploads.
    pub retry: RetryConfig,
    /// Minimum spacing between upload passes.
    pub crud_upload_throttle: Duration,
    /// Pause after a checksum failure before re-requesting.
    pub checksum_retry_delay: Duration,
    /// Transport selected at construction.
    pub transport: TransportKind,
    /// Socket flow control.
    pub flow: FlowControlConfig,
    /// Socket watchdog: abort when no frame arrives for this long.
    pub stale_timeout: Duration,
    /// Keepalive interval requested from the socket server.
    pub keepalive_interval: Duration,
    /// Connection lifetime announced to the socket server.
    pub token_lifetime: Duration,
    /// Sync parameters forwarded in every stream request.
    pub params: Option<Map<String, Value>>,
    /// Refresh cached credentials this long before they expire.
    pub credential_refresh_margin: Duration,
    /// Default batch size offered to the connector.
    pub crud_batch_limit: usize,
    /// Value of the `User-Agent` header and socket setup field.
    pub user_agent: String,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            crud_upload_throttle: Duration::from_secs(1),
            checksum_retry_delay: Duration::from_millis(50),
            transport: TransportKind::Http,
            flow: FlowControlConfig::default(),
            stale_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(20),
            token_lifetime: Duration::from_secs(30),
            params: None,
            credential_refresh_margin: Duration::from_secs(30),
            crud_batch_limit: 100,
            user_agent: concat!("bucketsync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the upload throttle interval.
    pub fn with_crud_upload_throttle(mut self, interval: Duration) -> Self {
        self.crud_upload_throttle = interval;
        self
    }

    /// Sets the pause after a checksum failure.
    pub fn with_checksum_retry_delay(mut self, delay: Duration) -> Self {
        self.checksum_retry_delay = delay;
        self
    }

    /// Selects the transport.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Sets socket flow control.
    pub fn with_flow(mut self, flow: FlowControlConfig) -> Self {
        self.flow = flow;
        self
    }

    /// Sets the socket watchdog timeout.
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    /// Sets the socket keepalive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Sets the socket connection lifetime.
    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    /// Sets the sync parameters.
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Sets the credential refresh margin.
    pub fn with_credential_refresh_margin(mut self, margin: Duration) -> Self {
        self.credential_refresh_margin = margin;
        self
    }

    /// Sets the default CRUD batch size.
    pub fn with_crud_batch_limit(mut self, limit: usize) -> Self {
        self.crud_batch_limit = limit;
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Credit window for the socket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlConfig {
    /// Credit granted up front and restored on each replenish.
    pub window: u32,
    /// Replenish once outstanding credit drops below this.
    pub low_water: u32,
    /// Do not replenish while this many lines wait unprocessed.
    pub high_water: usize,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            window: 10,
            low_water: 5,
            high_water: 20,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a fixed-delay retry configuration.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Creates an exponential backoff configuration.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_crud_upload_throttle(Duration::from_millis(10))
            .with_transport(TransportKind::Socket)
            .with_crud_batch_limit(25)
            .with_user_agent("test/1");

        assert_eq!(config.crud_upload_throttle, Duration::from_millis(10));
        assert_eq!(config.transport, TransportKind::Socket);
        assert_eq!(config.crud_batch_limit, 25);
        assert_eq!(config.user_agent, "test/1");
        assert_eq!(config.checksum_retry_delay, Duration::from_millis(50));
        assert_eq!(config.flow.window, 10);
        assert_eq!(config.flow.low_water, 5);
        assert_eq!(config.flow.high_water, 20);
    }

    #[test]
    fn default_retry_is_fixed() {
        let config = RetryConfig::default();
        for attempt in 1..5 {
            assert_eq!(config.delay_for_attempt(attempt), Duration::from_secs(5));
        }
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::exponential(Duration::from_millis(100), Duration::from_secs(30));

        // First attempt has no delay
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::exponential(Duration::from_secs(1), Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250)); // 5s + 25% jitter
    }
}
