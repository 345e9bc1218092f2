//! WebSocket client for real-time channels.
//!
//! This module provides the shared socket used by every feature of the
//! marketplace: order chat, exchange rates, advert lists and the user's
//! own push updates.
//!
//! # Example
//!
//! ```rust,ignore
//! use p2p_realtime_client::ws::{ChannelClient, WsConfig};
//! use p2p_realtime_client::session::StaticToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ChannelClient::new(WsConfig::new("wss://p2p.example/ws"), StaticToken::new("t"))?;
//!
//!     // Connect to the server
//!     client.connect().await?;
//!
//!     // Listen before joining so no frame is missed
//!     let _sub = client.subscribe(|frame| println!("Received: {:?}", frame.value()));
//!
//!     client.join_exchange_rates_channel("USD", Some("IDR"));
//!     client.subscribe_to_user_updates();
//!
//!     tokio::signal::ctrl_c().await?;
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

pub mod channels;
pub mod client;
pub mod config;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod reconnect;
pub mod router;
pub mod subscribers;

pub use channels::{
    advert_channel, exchange_rate_channel, AdvertType, Channel, ChannelRegistry, LeaveOutcome,
    ORDERS_CHANNEL, USER_CHANNEL,
};
pub use client::{ChannelClient, ChannelClientBuilder, CloseInfo, ConnectionState, LifecycleHooks};
pub use config::{WsConfig, DEFAULT_WS_URL};
pub use error::WsError;
pub use messages::{Action, Balance, BalanceUpdate, Envelope, EnvelopeOptions, InboundFrame};
pub use metrics::{ClientMetrics, ClientMetricsSnapshot};
pub use reconnect::ReconnectPolicy;
pub use router::{MessageRouter, RouteOutcome};
pub use subscribers::{Delivery, SubscriberId, SubscriberSet, Subscription};
