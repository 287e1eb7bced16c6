//! Store tuning knobs.

use opsync_feed::DEFAULT_FEED_CAPACITY;
use std::time::Duration;

/// Configuration for an entity store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// How old a cached collection may be and still be adopted by `load`.
    pub cache_ttl: Duration,
    /// How long a written id waits for its change feed echo.
    pub echo_grace: Duration,
    /// Deadline applied to every remote call.
    pub request_timeout: Duration,
    /// How often the feed pump sweeps expired echoes.
    pub sweep_interval: Duration,
    /// Capacity of the change feed channel.
    pub feed_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(120),
            echo_grace: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(500),
            feed_buffer: DEFAULT_FEED_CAPACITY,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_echo_grace(mut self, grace: Duration) -> Self {
        self.echo_grace = grace;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_feed_buffer(mut self, capacity: usize) -> Self {
        self.feed_buffer = capacity;
        self
    }
}
