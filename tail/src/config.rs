//! Tail configuration.
//!
//! Read from the environment by the binary; every field also has a
//! builder setter so tests and embedders can skip the environment.

use std::time::Duration;

use p2p_realtime_client::ws::{Channel, ReconnectPolicy, WsConfig, DEFAULT_WS_URL};
use serde::{Deserialize, Serialize};

use crate::printer::OutputFormat;

/// Socket URL variable.
pub const ENV_SOCKET_URL: &str = "P2P_SOCKET_URL";
/// Session token variable.
pub const ENV_SOCKET_TOKEN: &str = "P2P_SOCKET_TOKEN";
/// Comma-separated channel list variable.
pub const ENV_CHANNELS: &str = "P2P_CHANNELS";
/// Push-update toggle variable.
pub const ENV_USER_UPDATES: &str = "P2P_USER_UPDATES";
/// Reconnect attempt cap variable.
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "P2P_MAX_RECONNECT_ATTEMPTS";
/// Output format variable, `text` or `json`.
pub const ENV_OUTPUT: &str = "P2P_OUTPUT";

/// One channel to join at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    /// The order chat for one order, written `orders:<id>`.
    Order(u64),
    /// Any other known channel key.
    Channel(Channel),
}

impl JoinTarget {
    /// Parses one entry of the channel list.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown keys, a bare `orders`, or `users/me`
    /// (which is driven by the push-update toggle instead).
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let entry = entry.trim();
        if let Some(order_id) = entry.strip_prefix("orders:") {
            return order_id
                .parse()
                .map(Self::Order)
                .map_err(|_| ConfigError::InvalidOrderId(order_id.to_string()));
        }

        match Channel::parse(entry) {
            Some(Channel::Orders) => Err(ConfigError::MissingOrderId),
            Some(Channel::User) => Err(ConfigError::UserChannelInList),
            Some(channel) => Ok(Self::Channel(channel)),
            None => Err(ConfigError::InvalidChannel(entry.to_string())),
        }
    }

    /// Returns true if the server only serves this channel to a signed-in
    /// socket.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        match self {
            Self::Order(_) => true,
            Self::Channel(channel) => channel.requires_auth(),
        }
    }
}

impl std::fmt::Display for JoinTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Order(id) => write!(f, "orders:{id}"),
            Self::Channel(channel) => write!(f, "{channel}"),
        }
    }
}

/// Configuration for the tail binary.
#[derive(Clone, Serialize, Deserialize)]
pub struct TailConfig {
    /// WebSocket URL.
    pub url: String,

    /// Session token, if any.
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// Raw channel list entries.
    pub channels: Vec<String>,

    /// Whether to request push updates on `users/me`.
    pub user_updates: bool,

    /// Reconnect attempts before giving up. Zero disables reconnects.
    pub max_reconnect_attempts: u32,

    /// Handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// How frames are printed.
    pub output: OutputFormat,
}

impl std::fmt::Debug for TailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("channels", &self.channels)
            .field("user_updates", &self.user_updates)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("output", &self.output)
            .finish()
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            token: None,
            channels: Vec::new(),
            user_updates: false,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 10_000,
            output: OutputFormat::Text,
        }
    }
}

impl TailConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults
    /// for missing keys.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_SOCKET_URL) {
            config.url = url;
        }

        config.token = lookup(ENV_SOCKET_TOKEN).filter(|token| !token.trim().is_empty());

        if let Some(channels) = lookup(ENV_CHANNELS) {
            config.channels = channels
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(flag) = lookup(ENV_USER_UPDATES) {
            config.user_updates = parse_flag(&flag)?;
        }

        if let Some(attempts) = lookup(ENV_MAX_RECONNECT_ATTEMPTS) {
            config.max_reconnect_attempts = attempts
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber(ENV_MAX_RECONNECT_ATTEMPTS, attempts))?;
        }

        if let Some(output) = lookup(ENV_OUTPUT) {
            config.output =
                OutputFormat::parse(&output).ok_or(ConfigError::InvalidOutput(output))?;
        }

        Ok(config)
    }

    /// Sets the URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the session token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the channel list.
    #[must_use]
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    /// Enables push updates on `users/me`.
    #[must_use]
    pub fn with_user_updates(mut self, enabled: bool) -> Self {
        self.user_updates = enabled;
        self
    }

    /// Sets the reconnect attempt cap.
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Parses the channel list.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry is invalid.
    pub fn join_targets(&self) -> Result<Vec<JoinTarget>, ConfigError> {
        self.channels.iter().map(|entry| JoinTarget::parse(entry)).collect()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConnectTimeout);
        }

        let targets = self.join_targets()?;
        if self.token.is_none() {
            if let Some(target) = targets.iter().find(|target| target.requires_auth()) {
                return Err(ConfigError::TokenRequired(target.to_string()));
            }
            if self.user_updates {
                return Err(ConfigError::TokenRequired("users/me".to_string()));
            }
        }

        self.ws_config()
            .validate()
            .map_err(|e| ConfigError::Socket(e.to_string()))
    }

    /// Builds the client configuration.
    #[must_use]
    pub fn ws_config(&self) -> WsConfig {
        let reconnect = if self.max_reconnect_attempts == 0 {
            ReconnectPolicy::disabled()
        } else {
            ReconnectPolicy::default().with_max_attempts(self.max_reconnect_attempts)
        };

        WsConfig::new(self.url.clone())
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_reconnect(reconnect)
    }
}

fn parse_flag(value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidFlag(ENV_USER_UPDATES, value.to_string())),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Unknown channel key.
    #[error("unknown channel: {0}")]
    InvalidChannel(String),

    /// `orders` without an order id.
    #[error("orders channel needs an order id, write orders:<id>")]
    MissingOrderId,

    /// Order id that is not a number.
    #[error("invalid order id: {0}")]
    InvalidOrderId(String),

    /// `users/me` in the channel list.
    #[error("users/me is joined through P2P_USER_UPDATES")]
    UserChannelInList,

    /// Channel that needs a session token.
    #[error("{0} requires P2P_SOCKET_TOKEN")]
    TokenRequired(String),

    /// Unparseable number.
    #[error("{0} must be a number, got {1:?}")]
    InvalidNumber(&'static str, String),

    /// Unparseable boolean.
    #[error("{0} must be a boolean, got {1:?}")]
    InvalidFlag(&'static str, String),

    /// Unknown output format.
    #[error("P2P_OUTPUT must be text or json, got {0:?}")]
    InvalidOutput(String),

    /// Zero handshake timeout.
    #[error("connect_timeout_ms must be > 0")]
    InvalidConnectTimeout,

    /// Rejected by the client configuration.
    #[error("socket config: {0}")]
    Socket(String),
}
