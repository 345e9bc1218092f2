//! WebSocket configuration.
//!
//! Provides configuration options for the channel client.

use std::time::Duration;

use super::error::WsError;
use super::reconnect::ReconnectPolicy;

/// Default socket URL.
pub const DEFAULT_WS_URL: &str = "wss://p2p.example/ws";

/// Default handshake timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default time to wait for the server to acknowledge a close, in seconds.
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 5;

/// Default capacity of the outbound frame buffer.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Channel client configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// WebSocket URL.
    pub url: String,

    /// Handshake timeout.
    pub connect_timeout: Duration,

    /// How long a graceful close may wait for the server.
    pub close_timeout: Duration,

    /// Capacity of the outbound frame buffer.
    pub outbound_buffer: usize,

    /// Behavior after an unexpected close.
    pub reconnect: ReconnectPolicy,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            close_timeout: Duration::from_secs(DEFAULT_CLOSE_TIMEOUT_SECS),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl WsConfig {
    /// Creates a new configuration with the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the graceful close timeout.
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the outbound buffer capacity.
    #[must_use]
    pub fn with_outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = capacity;
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), WsError> {
        if self.url.is_empty() {
            return Err(WsError::InvalidConfig("url cannot be empty".to_string()));
        }

        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(WsError::InvalidConfig(
                "url must start with ws:// or wss://".to_string(),
            ));
        }

        if self.outbound_buffer == 0 {
            return Err(WsError::InvalidConfig(
                "outbound_buffer must be > 0".to_string(),
            ));
        }

        self.reconnect.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WsConfig::default();
        assert_eq!(config.url, DEFAULT_WS_URL);
        assert_eq!(
            config.connect_timeout,
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        );
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
        assert!(config.reconnect.enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = WsConfig::new("wss://example.com/ws")
            .with_connect_timeout(Duration::from_secs(3))
            .with_close_timeout(Duration::from_millis(500))
            .with_outbound_buffer(16)
            .with_reconnect(ReconnectPolicy::disabled());

        assert_eq!(config.url, "wss://example.com/ws");
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.close_timeout, Duration::from_millis(500));
        assert_eq!(config.outbound_buffer, 16);
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn test_config_validate_valid() {
        assert!(WsConfig::new("ws://127.0.0.1:9000").validate().is_ok());
    }

    #[test]
    fn test_config_validate_empty_url() {
        assert!(WsConfig::new("").validate().is_err());
    }

    #[test]
    fn test_config_validate_invalid_scheme() {
        assert!(WsConfig::new("https://example.com/ws").validate().is_err());
    }

    #[test]
    fn test_config_validate_zero_buffer() {
        let config = WsConfig::new("wss://example.com/ws").with_outbound_buffer(0);
        assert!(config.validate().is_err());
    }
}
