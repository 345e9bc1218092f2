//! WebSocket message types.
//!
//! Outbound frames share one fixed envelope, `{action, options, payload}`,
//! which the server expects byte-for-byte in shape. Inbound frames carry
//! whatever JSON the server emitted; [`InboundFrame`] only offers lenient
//! accessors over it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::channels::exchange_rate_channel;
use super::error::WsError;

/// Envelope actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Join a channel.
    Join,
    /// Leave a channel.
    Leave,
    /// Request push updates on a joined channel.
    Subscribe,
    /// Stop push updates on a joined channel.
    Unsubscribe,
    /// Channel-scoped request.
    Message,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Join => write!(f, "join"),
            Self::Leave => write!(f, "leave"),
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
            Self::Message => write!(f, "message"),
        }
    }
}

/// Envelope options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeOptions {
    /// Target channel key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Extra options, serialized next to `channel`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EnvelopeOptions {
    /// Options addressing a single channel.
    #[must_use]
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            extra: Map::new(),
        }
    }
}

/// Client-to-server envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// What the server should do.
    pub action: Action,
    /// Addressing.
    pub options: EnvelopeOptions,
    /// Action-specific body.
    pub payload: Value,
}

impl Envelope {
    /// Creates an envelope addressed to `channel`.
    #[must_use]
    pub fn new(action: Action, channel: impl Into<String>, payload: Value) -> Self {
        Self {
            action,
            options: EnvelopeOptions::channel(channel),
            payload,
        }
    }

    /// `{action:"join", options:{channel}, payload}`.
    #[must_use]
    pub fn join(channel: impl Into<String>, payload: Value) -> Self {
        Self::new(Action::Join, channel, payload)
    }

    /// `{action:"leave", options:{channel}, payload:{}}`.
    #[must_use]
    pub fn leave(channel: impl Into<String>) -> Self {
        Self::new(Action::Leave, channel, empty_payload())
    }

    /// `{action:"subscribe", options:{channel}, payload:{}}`.
    #[must_use]
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::new(Action::Subscribe, channel, empty_payload())
    }

    /// `{action:"unsubscribe", options:{channel}, payload:{}}`.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::new(Action::Unsubscribe, channel, empty_payload())
    }

    /// `{action:"message", options:{channel}, payload}`.
    #[must_use]
    pub fn message(channel: impl Into<String>, payload: Value) -> Self {
        Self::new(Action::Message, channel, payload)
    }

    /// Requests the chat history of an order.
    #[must_use]
    pub fn chat_history(channel: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self::message(
            channel,
            json!({ "chat_history": true, "order_id": order_id.into() }),
        )
    }

    /// Requests the current rate on the exchange-rate channel.
    #[must_use]
    pub fn exchange_rate_request(buy: &str, for_currency: Option<&str>) -> Self {
        Self::message(exchange_rate_channel(buy, for_currency), empty_payload())
    }

    /// Adds an extra option next to `channel`.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.extra.insert(key.into(), value);
        self
    }

    /// Returns the target channel, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.options.channel.as_deref()
    }

    /// Encodes the envelope as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_json(&self) -> Result<String, WsError> {
        serde_json::to_string(self).map_err(|e| WsError::Serialization(e.to_string()))
    }
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// A parsed server-to-client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    value: Value,
}

impl InboundFrame {
    /// Wraps an already parsed value.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON.
    pub fn parse(text: &str) -> Result<Self, WsError> {
        serde_json::from_str(text)
            .map(Self::new)
            .map_err(|e| WsError::Deserialization(e.to_string()))
    }

    /// The raw value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consumes the frame, returning the raw value.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// `action`, when present and a string.
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.value.get("action").and_then(Value::as_str)
    }

    /// `options.channel`, when present and a string.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.value
            .get("options")
            .and_then(|options| options.get("channel"))
            .and_then(Value::as_str)
    }

    /// `payload`, when present.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.value.get("payload")
    }

    /// Returns true if the frame is tagged with `channel`.
    #[must_use]
    pub fn is_on_channel(&self, channel: &str) -> bool {
        self.channel() == Some(channel)
    }

    /// Decodes the whole frame into `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, WsError> {
        T::deserialize(&self.value).map_err(|e| WsError::Deserialization(e.to_string()))
    }

    /// Decodes a `balance_updated` push, if this frame is one.
    #[must_use]
    pub fn balance_update(&self) -> Option<BalanceUpdate> {
        if self.action() != Some(BALANCE_UPDATED) {
            return None;
        }
        self.payload()
            .and_then(|payload| BalanceUpdate::deserialize(payload).ok())
    }
}

/// Action name of the balance push.
pub const BALANCE_UPDATED: &str = "balance_updated";

/// Payload of a `balance_updated` push.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BalanceUpdate {
    /// Balances per currency.
    pub balances: Vec<Balance>,
    /// Owner of the balances.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// A single currency balance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Balance {
    /// Decimal amount as sent by the server.
    pub amount: String,
    /// Currency code.
    pub currency: String,
}
