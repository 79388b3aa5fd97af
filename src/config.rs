use std::time::Duration;

/// Configuration for a [`crate::ComfyClient`].
///
/// Use [`ClientConfig::builder()`] for ergonomic construction, or
/// [`ClientConfig::default()`] for sensible defaults (fresh client id,
/// 30 s requests, 256-event subscriber queues).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identifier the server uses to address event-stream messages.
    pub client_id: String,

    /// Timeout for ordinary REST calls.
    pub request_timeout: Duration,

    /// Timeout for the `/system_stats` reachability probe.
    pub health_timeout: Duration,

    /// Timeout for image downloads and uploads.
    pub download_timeout: Duration,

    /// Timeout for the event-stream handshake.
    pub connect_timeout: Duration,

    /// Capacity of each subscriber's event queue.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            request_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            download_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = id.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.config.health_timeout = timeout;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the per-subscriber queue capacity. Clamped to at least 1.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity.max(1);
        self
    }

    /// Build the final [`ClientConfig`].
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
