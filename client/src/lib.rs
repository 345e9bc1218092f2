//! P2P Realtime Client - shared WebSocket channel client for the P2P
//! marketplace.
//!
//! One socket carries every realtime feature. Features join the channels
//! they need and register callbacks; the client keeps the channel set in
//! sync with the server across reconnects.
//!
//! # Core Types
//!
//! - [`ChannelClient`] — The shared connection manager
//! - [`Envelope`] — Outbound `{action, options, payload}` frame
//! - [`InboundFrame`] — Parsed inbound frame handed to subscribers
//! - [`Subscription`] — Disposer returned by `subscribe`
//! - [`TokenSource`] — Where the session token comes from
//!
//! # Example
//!
//! ```rust
//! use p2p_realtime_client::{exchange_rate_channel, Envelope};
//! use serde_json::json;
//!
//! let channel = exchange_rate_channel("USD", Some("IDR"));
//! assert_eq!(channel, "exchange_rates/USD/IDR");
//!
//! let frame = Envelope::join(channel, json!({})).to_json().unwrap();
//! assert!(frame.contains(r#""action":"join""#));
//! ```

pub mod session;
pub mod ws;

pub use session::{NoToken, SharedToken, StaticToken, TokenSource};
pub use ws::{
    advert_channel, exchange_rate_channel, AdvertType, ChannelClient, CloseInfo, ConnectionState,
    Envelope, InboundFrame, LifecycleHooks, ReconnectPolicy, Subscription, WsConfig, WsError,
};
