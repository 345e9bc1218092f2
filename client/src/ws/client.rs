//! WebSocket client implementation.
//!
//! One [`ChannelClient`] owns the single physical socket of the process.
//! Clones are cheap handles onto the same connection, registry and
//! subscriber set; hand them to every feature that needs realtime updates.
//!
//! A background task owns the socket. It writes frames queued by
//! [`ChannelClient::send`] and routes every inbound frame to the
//! subscribers, inline and in order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::channels::{
    advert_channel, exchange_rate_channel, AdvertType, ChannelRegistry, ORDERS_CHANNEL,
    USER_CHANNEL,
};
use super::config::WsConfig;
use super::error::WsError;
use super::messages::{Envelope, InboundFrame};
use super::metrics::ClientMetrics;
use super::router::MessageRouter;
use super::subscribers::Subscription;
use crate::session::{usable_token, NoToken, TokenSource};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle state of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Frames can be sent.
    Open,
    /// Close requested locally, waiting for the socket to finish.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// How a socket ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code, when the peer sent one.
    pub code: Option<u16>,
    /// Close reason or transport error.
    pub reason: String,
    /// True when `disconnect()` asked for the close.
    pub initiated_locally: bool,
}

impl CloseInfo {
    fn from_frame(frame: Option<CloseFrame>, initiated_locally: bool) -> Self {
        match frame {
            Some(frame) => Self {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.as_str().to_string(),
                initiated_locally,
            },
            None => Self {
                code: None,
                reason: String::new(),
                initiated_locally,
            },
        }
    }

    fn abandoned(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            initiated_locally: true,
        }
    }

    fn lost(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            initiated_locally: false,
        }
    }
}

type OpenHook = Arc<dyn Fn() + Send + Sync>;
type CloseHook = Arc<dyn Fn(&CloseInfo) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&WsError) + Send + Sync>;
type GiveUpHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Callbacks for connection lifecycle events.
///
/// Hooks run on the socket task; keep them short.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    on_open: Option<OpenHook>,
    on_close: Option<CloseHook>,
    on_error: Option<ErrorHook>,
    on_give_up: Option<GiveUpHook>,
}

impl LifecycleHooks {
    /// Creates an empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called each time the socket reaches `Open`.
    #[must_use]
    pub fn on_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    /// Called when an open socket closes, for any reason.
    #[must_use]
    pub fn on_close(mut self, hook: impl Fn(&CloseInfo) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    /// Called when a handshake fails.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&WsError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Called once the reconnect policy has exhausted its attempts.
    #[must_use]
    pub fn on_give_up(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_give_up = Some(Arc::new(hook));
        self
    }

    fn opened(&self) {
        if let Some(hook) = &self.on_open {
            hook();
        }
    }

    fn closed(&self, info: &CloseInfo) {
        if let Some(hook) = &self.on_close {
            hook(info);
        }
    }

    fn failed(&self, err: &WsError) {
        if let Some(hook) = &self.on_error {
            hook(err);
        }
    }

    fn gave_up(&self, attempts: u32) {
        if let Some(hook) = &self.on_give_up {
            hook(attempts);
        }
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_give_up", &self.on_give_up.is_some())
            .finish()
    }
}

/// Commands for the socket task.
#[derive(Debug)]
enum Outbound {
    Frame(String),
    Close,
}

/// Mutable link state. Only touched under the `link` lock; the
/// `generation` counter lets a superseded socket task detect that it no
/// longer owns the connection.
#[derive(Debug, Default)]
struct Link {
    generation: u64,
    outbound: Option<mpsc::Sender<Outbound>>,
    pending: Option<oneshot::Sender<Result<(), WsError>>>,
    socket_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl Link {
    fn abort_socket(&mut self) {
        self.generation += 1;
        self.outbound = None;
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
    }

    fn abort_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.send(Err(WsError::Cancelled));
        }
    }
}

struct Shared {
    config: WsConfig,
    tokens: Arc<dyn TokenSource>,
    hooks: LifecycleHooks,
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    registry: ChannelRegistry,
    router: MessageRouter,
    metrics: Arc<ClientMetrics>,
}

impl Shared {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }
}

/// Builder for [`ChannelClient`].
pub struct ChannelClientBuilder {
    config: WsConfig,
    tokens: Option<Arc<dyn TokenSource>>,
    hooks: LifecycleHooks,
}

impl ChannelClientBuilder {
    /// Sets the session token source. Defaults to anonymous.
    #[must_use]
    pub fn token_source(mut self, tokens: impl TokenSource + 'static) -> Self {
        self.tokens = Some(Arc::new(tokens));
        self
    }

    /// Sets the lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<ChannelClient, WsError> {
        self.config.validate()?;

        let metrics = Arc::new(ClientMetrics::new());
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(ChannelClient {
            shared: Arc::new(Shared {
                config: self.config,
                tokens: self.tokens.unwrap_or_else(|| Arc::new(NoToken)),
                hooks: self.hooks,
                link: Mutex::new(Link::default()),
                state,
                registry: ChannelRegistry::new(),
                router: MessageRouter::new(Arc::clone(&metrics)),
                metrics,
            }),
        })
    }
}

impl std::fmt::Debug for ChannelClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClientBuilder")
            .field("config", &self.config)
            .field("token_source", &self.tokens.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Shared realtime channel client.
#[derive(Clone)]
pub struct ChannelClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .field("channels", &self.joined_channels())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ChannelClient {
    /// Starts building a client with the given configuration.
    #[must_use]
    pub fn builder(config: WsConfig) -> ChannelClientBuilder {
        ChannelClientBuilder {
            config,
            tokens: None,
            hooks: LifecycleHooks::default(),
        }
    }

    /// Creates a client reading its token from `tokens`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: WsConfig, tokens: impl TokenSource + 'static) -> Result<Self, WsError> {
        Self::builder(config).token_source(tokens).build()
    }

    /// Creates an anonymous client for the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_url(url: impl Into<String>) -> Result<Self, WsError> {
        Self::builder(WsConfig::new(url)).build()
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &WsConfig {
        &self.shared.config
    }

    /// Returns the client metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<ClientMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns a receiver that observes state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Returns true only when the socket is `Open`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Opens the shared socket.
    ///
    /// Resolves immediately when already open. A second call while a
    /// handshake is in flight fails with [`WsError::ConnectInProgress`]
    /// instead of opening another socket.
    ///
    /// A session token is offered as the only `Sec-WebSocket-Protocol`
    /// value, and the server must echo it back in its upgrade response.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails, another connect is in
    /// flight, or `disconnect()` cancels this one. A server that accepts
    /// the upgrade without echoing the token yields
    /// [`WsError::SubprotocolNotEchoed`].
    pub async fn connect(&self) -> Result<(), WsError> {
        let (pending, abandoned) = {
            let mut link = self.shared.lock_link();
            let abandoned = match self.shared.state() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting => return Err(WsError::ConnectInProgress),
                ConnectionState::Closing => {
                    debug!("Abandoning closing socket for a new connect");
                    link.abort_socket();
                    self.shared.metrics.record_connection_closed();
                    Some(CloseInfo::abandoned("abandoned for a new connect"))
                }
                ConnectionState::Disconnected => None,
            };

            let (tx, rx) = oneshot::channel();
            link.generation += 1;
            link.pending = Some(tx);
            link.outbound = None;
            self.shared.set_state(ConnectionState::Connecting);

            let generation = link.generation;
            let client = self.clone();
            link.socket_task = Some(tokio::spawn(async move {
                client.run_socket(generation).await;
            }));
            (rx, abandoned)
        };

        if let Some(info) = abandoned {
            self.shared.hooks.closed(&info);
        }
        pending.await.unwrap_or(Err(WsError::Cancelled))
    }

    /// Closes the shared socket.
    ///
    /// An open socket moves to `Closing` and reaches `Disconnected` once the
    /// close completes. An in-flight connect is aborted and its caller gets
    /// [`WsError::Cancelled`]. Scheduled reconnects are cancelled. No-op when
    /// already disconnected. Joined channels are kept and replayed on the
    /// next connect.
    pub fn disconnect(&self) {
        let dropped = {
            let mut link = self.shared.lock_link();
            link.abort_reconnect();
            link.cancel_pending();
            self.stop(&mut link)
        };

        if let Some(info) = dropped {
            self.shared.hooks.closed(&info);
        }
    }

    fn stop(&self, link: &mut Link) -> Option<CloseInfo> {
        match self.shared.state() {
            ConnectionState::Disconnected => {
                debug!("Disconnect requested while disconnected");
                None
            }
            ConnectionState::Closing => {
                debug!("Disconnect already in progress");
                None
            }
            ConnectionState::Connecting => {
                info!("Aborting in-flight connect");
                link.abort_socket();
                self.shared.set_state(ConnectionState::Disconnected);
                None
            }
            ConnectionState::Open => {
                info!("Disconnecting");
                let requested = link
                    .outbound
                    .take()
                    .is_some_and(|outbound| outbound.try_send(Outbound::Close).is_ok());

                if requested {
                    self.shared.set_state(ConnectionState::Closing);
                    None
                } else {
                    warn!("Socket task unreachable; dropping socket without close handshake");
                    link.abort_socket();
                    self.shared.set_state(ConnectionState::Disconnected);
                    self.shared.metrics.record_connection_closed();
                    Some(CloseInfo::abandoned("dropped without close handshake"))
                }
            }
        }
    }

    /// Drops the current socket without a close handshake and connects
    /// again. Joined channels are replayed once the new socket opens.
    ///
    /// # Errors
    ///
    /// Returns an error if the new handshake fails.
    pub async fn reconnect(&self) -> Result<(), WsError> {
        info!("Manual reconnection requested");
        let dropped = {
            let mut link = self.shared.lock_link();
            link.abort_reconnect();
            link.cancel_pending();
            let was_open = matches!(
                self.shared.state(),
                ConnectionState::Open | ConnectionState::Closing
            );
            if self.shared.state() != ConnectionState::Disconnected {
                link.abort_socket();
                self.shared.set_state(ConnectionState::Disconnected);
            }
            was_open.then(|| {
                self.shared.metrics.record_connection_closed();
                CloseInfo::abandoned("replaced by manual reconnect")
            })
        };

        if let Some(info) = dropped {
            self.shared.hooks.closed(&info);
        }
        self.connect().await
    }

    /// Queues an envelope for the socket.
    ///
    /// Frames are never queued while the socket is not `Open`: they are
    /// dropped with a warning. Returns true if the frame was handed to the
    /// socket task.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(text) => self.send_text(text, &envelope.action.to_string()),
            Err(e) => {
                error!("Failed to encode {} envelope: {}", envelope.action, e);
                self.shared.metrics.record_frame_dropped();
                false
            }
        }
    }

    /// Queues an arbitrary JSON frame. Same delivery rules as [`send`].
    ///
    /// [`send`]: ChannelClient::send
    pub fn send_raw(&self, value: &Value) -> bool {
        let label = value
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("raw")
            .to_string();
        self.send_text(value.to_string(), &label)
    }

    fn send_text(&self, text: String, action: &str) -> bool {
        let link = self.shared.lock_link();
        let state = self.shared.state();

        let outbound = match (&link.outbound, state) {
            (Some(outbound), ConnectionState::Open) => outbound,
            _ => {
                warn!(%state, action, "Socket is not open; frame not sent");
                self.shared.metrics.record_frame_dropped();
                return false;
            }
        };

        match outbound.try_send(Outbound::Frame(text)) {
            Ok(()) => {
                debug!(action, "Frame queued");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(action, "Outbound buffer full; frame not sent");
                self.shared.metrics.record_frame_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(action, "Socket task gone; frame not sent");
                self.shared.metrics.record_frame_dropped();
                false
            }
        }
    }

    /// Registers a callback for every inbound frame.
    ///
    /// Callbacks run on the socket task in registration order and must not
    /// block. Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        self.shared.router.subscribe(callback)
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.router.subscriber_count()
    }

    /// Joins `channel` with `payload`.
    ///
    /// Every join goes on the wire; the registry counts holders so the
    /// matching `leave` is only sent when the last holder leaves.
    pub fn join_channel(&self, channel: &str, payload: Value) -> bool {
        let holders = self.shared.registry.join(channel, &payload);
        debug!(channel, holders, "Joining channel");
        self.send(&Envelope::join(channel, payload))
    }

    /// Leaves `channel`. Sends `leave` only when no other holder remains.
    pub fn leave_channel(&self, channel: &str) -> bool {
        self.release_channel(channel, None)
    }

    /// Leaves `channel` as the holder that joined with `payload`, so the
    /// payload is no longer replayed after a reconnect.
    pub fn leave_channel_with(&self, channel: &str, payload: &Value) -> bool {
        self.release_channel(channel, Some(payload))
    }

    fn release_channel(&self, channel: &str, payload: Option<&Value>) -> bool {
        let outcome = self.shared.registry.leave(channel, payload);
        if !outcome.sends_leave() {
            debug!(channel, ?outcome, "Channel still held; leave not sent");
            return false;
        }
        self.send(&Envelope::leave(channel))
    }

    /// Returns the channels currently held by some feature.
    #[must_use]
    pub fn joined_channels(&self) -> Vec<String> {
        self.shared.registry.joined_channels()
    }

    /// Returns how many features hold `channel`.
    #[must_use]
    pub fn channel_holders(&self, channel: &str) -> usize {
        self.shared.registry.holders(channel)
    }

    /// Joins the order chat channel for `order_id`.
    pub fn join_order_channel(&self, order_id: u64) -> bool {
        self.join_channel(ORDERS_CHANNEL, json!({ "order_id": order_id }))
    }

    /// Releases the order chat channel held for `order_id`.
    pub fn leave_order_channel(&self, order_id: u64) -> bool {
        self.leave_channel_with(ORDERS_CHANNEL, &json!({ "order_id": order_id }))
    }

    /// Requests the chat history of `order_id` on `channel`.
    pub fn get_chat_history(&self, channel: &str, order_id: &str) -> bool {
        self.send(&Envelope::chat_history(channel, order_id))
    }

    /// Joins the exchange-rate channel.
    pub fn join_exchange_rates_channel(&self, buy: &str, for_currency: Option<&str>) -> bool {
        self.join_channel(&exchange_rate_channel(buy, for_currency), json!({}))
    }

    /// Leaves the exchange-rate channel.
    pub fn leave_exchange_rates_channel(&self, buy: &str, for_currency: Option<&str>) -> bool {
        self.leave_channel(&exchange_rate_channel(buy, for_currency))
    }

    /// Asks the server for the current rate on the exchange-rate channel.
    pub fn request_exchange_rate(&self, buy: &str, for_currency: Option<&str>) -> bool {
        self.send(&Envelope::exchange_rate_request(buy, for_currency))
    }

    /// Joins the advert list channel.
    pub fn join_adverts_channel(
        &self,
        account_currency: &str,
        local_currency: &str,
        advert_type: AdvertType,
    ) -> bool {
        self.join_channel(
            &advert_channel(account_currency, local_currency, advert_type),
            json!({}),
        )
    }

    /// Leaves the advert list channel.
    pub fn leave_adverts_channel(
        &self,
        account_currency: &str,
        local_currency: &str,
        advert_type: AdvertType,
    ) -> bool {
        self.leave_channel(&advert_channel(
            account_currency,
            local_currency,
            advert_type,
        ))
    }

    /// Joins `users/me` and then asks for push updates on it.
    ///
    /// Only this channel takes the second `subscribe` verb.
    pub fn subscribe_to_user_updates(&self) -> bool {
        let joined = self.join_channel(USER_CHANNEL, json!({}));
        self.shared.registry.request_push(USER_CHANNEL);
        let subscribed = self.send(&Envelope::subscribe(USER_CHANNEL));
        joined && subscribed
    }

    /// Stops push updates on `users/me`, then leaves it.
    ///
    /// Other holders keep the channel joined; `unsubscribe` is only sent
    /// once no holder wants push updates.
    pub fn unsubscribe_from_user_updates(&self) -> bool {
        let remaining = self.shared.registry.release_push(USER_CHANNEL);
        let unsubscribed = if remaining == 0 {
            self.send(&Envelope::unsubscribe(USER_CHANNEL))
        } else {
            debug!(remaining, "Push updates still wanted; unsubscribe not sent");
            false
        };
        let left = self.leave_channel(USER_CHANNEL);
        unsubscribed && left
    }

    async fn run_socket(self, generation: u64) {
        let token = usable_token(self.shared.tokens.as_ref());
        info!(
            url = %self.shared.config.url,
            authenticated = token.is_some(),
            "Connecting to WebSocket"
        );

        let stream = match open_socket(&self.shared.config, token.as_deref()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.handshake_failed(generation, e);
                return;
            }
        };

        let (tx, rx) = mpsc::channel(self.shared.config.outbound_buffer);
        if !self.socket_opened(generation, tx) {
            debug!("Socket opened after being superseded; dropping it");
            return;
        }

        let close = self.pump(stream, rx).await;
        self.socket_closed(generation, close);
    }

    fn socket_opened(&self, generation: u64, outbound: mpsc::Sender<Outbound>) -> bool {
        let resynced = {
            let mut link = self.shared.lock_link();
            if link.generation != generation {
                return false;
            }

            let mut resynced = 0;
            for envelope in self.shared.registry.resync_envelopes() {
                let queued = envelope
                    .to_json()
                    .map(|text| outbound.try_send(Outbound::Frame(text)).is_ok())
                    .unwrap_or(false);
                if queued {
                    resynced += 1;
                } else {
                    warn!(channel = envelope.channel(), "Failed to queue channel resync");
                    self.shared.metrics.record_frame_dropped();
                }
            }

            link.outbound = Some(outbound);
            self.shared.set_state(ConnectionState::Open);
            if let Some(pending) = link.pending.take() {
                let _ = pending.send(Ok(()));
            }
            resynced
        };

        self.shared.metrics.record_connection_opened();
        info!(resynced, "WebSocket connected");
        self.shared.hooks.opened();
        true
    }

    fn handshake_failed(&self, generation: u64, err: WsError) {
        let pending = {
            let mut link = self.shared.lock_link();
            if link.generation != generation {
                return;
            }
            link.socket_task = None;
            self.shared.set_state(ConnectionState::Disconnected);
            link.pending.take()
        };

        self.shared.metrics.record_handshake_failure();
        error!("WebSocket handshake failed: {}", err);
        self.shared.hooks.failed(&err);
        if let Some(pending) = pending {
            let _ = pending.send(Err(err));
        }
    }

    async fn pump(&self, mut ws: WsStream, mut outbound: mpsc::Receiver<Outbound>) -> CloseInfo {
        loop {
            tokio::select! {
                command = outbound.recv() => match command {
                    Some(Outbound::Frame(text)) => {
                        if let Err(e) = ws.send(Message::Text(text.into())).await {
                            warn!("Failed to write frame: {}", e);
                            return CloseInfo::lost(e.to_string());
                        }
                        self.shared.metrics.record_frame_sent();
                    }
                    Some(Outbound::Close) | None => {
                        return self.close_gracefully(&mut ws).await;
                    }
                },
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.shared.router.route_text(text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.shared.router.route_binary(&data);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let _ = ws.close(None).await;
                        return CloseInfo::from_frame(frame, false);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return CloseInfo::lost(e.to_string()),
                    None => return CloseInfo::lost("stream ended"),
                }
            }
        }
    }

    async fn close_gracefully(&self, ws: &mut WsStream) -> CloseInfo {
        if let Err(e) = ws.close(None).await {
            debug!("Close frame not sent: {}", e);
            return CloseInfo {
                code: None,
                reason: e.to_string(),
                initiated_locally: true,
            };
        }

        let reply = async {
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Close(frame) = frame {
                    return frame;
                }
            }
            None
        };

        match tokio::time::timeout(self.shared.config.close_timeout, reply).await {
            Ok(frame) => CloseInfo::from_frame(frame, true),
            Err(_) => {
                warn!(
                    "Server did not acknowledge close within {:?}",
                    self.shared.config.close_timeout
                );
                CloseInfo {
                    code: None,
                    reason: "close timed out".to_string(),
                    initiated_locally: true,
                }
            }
        }
    }

    fn socket_closed(&self, generation: u64, mut close: CloseInfo) {
        let schedule_reconnect = {
            let mut link = self.shared.lock_link();
            if link.generation != generation {
                return;
            }
            close.initiated_locally |= self.shared.state() == ConnectionState::Closing;
            link.outbound = None;
            link.socket_task = None;
            self.shared.set_state(ConnectionState::Disconnected);

            let reconnect = !close.initiated_locally && self.shared.config.reconnect.enabled;
            if reconnect {
                let client = self.clone();
                link.abort_reconnect();
                link.reconnect_task = Some(tokio::spawn(async move {
                    client.reconnect_with_backoff().await;
                }));
            }
            reconnect
        };

        self.shared.metrics.record_connection_closed();
        if close.initiated_locally {
            info!(code = ?close.code, "WebSocket closed");
        } else {
            warn!(
                code = ?close.code,
                reason = %close.reason,
                reconnect = schedule_reconnect,
                "WebSocket closed unexpectedly"
            );
        }
        self.shared.hooks.closed(&close);
    }

    async fn reconnect_with_backoff(self) {
        let policy = self.shared.config.reconnect.clone();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay(attempt);
            info!(
                "Scheduling reconnection attempt {}/{} in {:?}",
                attempt, policy.max_attempts, delay
            );
            tokio::time::sleep(delay).await;

            self.shared.metrics.record_reconnect_attempt();
            match self.connect().await {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    return;
                }
                Err(WsError::Cancelled) => {
                    debug!("Reconnect cancelled");
                    return;
                }
                Err(WsError::ConnectInProgress) => {
                    debug!(attempt, "Another connect is in flight; waiting for it");
                    if self.settle_in_flight().await == ConnectionState::Open {
                        info!(attempt, "Reconnected by another caller");
                        return;
                    }
                    warn!(attempt, "In-flight connect did not open the socket");
                }
                Err(e) => warn!(attempt, "Reconnection failed: {}", e),
            }
        }

        warn!(
            "Max reconnection attempts reached ({}); giving up",
            policy.max_attempts
        );
        self.shared.hooks.gave_up(policy.max_attempts);
    }

    /// Waits until a connect started elsewhere leaves `Connecting`, bounded
    /// by the handshake timeout.
    async fn settle_in_flight(&self) -> ConnectionState {
        let mut states = self.watch_state();
        let settled = tokio::time::timeout(
            self.shared.config.connect_timeout,
            states.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await;
        match settled {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        }
    }
}

async fn open_socket(config: &WsConfig, token: Option<&str>) -> Result<WsStream, WsError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| WsError::InvalidConfig(e.to_string()))?;

    if let Some(token) = token {
        let value =
            HeaderValue::from_str(token).map_err(|e| WsError::InvalidToken(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    let (stream, _response) =
        tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| {
                WsError::Handshake(format!("timed out after {:?}", config.connect_timeout))
            })??;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ws::reconnect::ReconnectPolicy;

    fn client() -> ChannelClient {
        ChannelClient::with_url("ws://127.0.0.1:9").expect("client creation")
    }

    #[test]
    fn test_client_new() {
        let client = ChannelClient::new(WsConfig::new("wss://example.com/ws"), NoToken);
        assert!(client.is_ok());
    }

    #[test]
    fn test_client_invalid_config() {
        assert!(ChannelClient::with_url("").is_err());
        assert!(ChannelClient::with_url("http://example.com").is_err());
    }

    #[test]
    fn test_client_config_access() {
        let config =
            WsConfig::new("wss://example.com/ws").with_reconnect(ReconnectPolicy::disabled());
        let client = ChannelClient::new(config, NoToken).expect("client creation");
        assert_eq!(client.config().url, "wss://example.com/ws");
        assert!(!client.config().reconnect.enabled);
    }

    #[test]
    fn test_client_starts_disconnected() {
        let client = client();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(client.joined_channels().is_empty());
    }

    #[test]
    fn test_send_while_disconnected_is_dropped() {
        let client = client();
        assert!(!client.send(&Envelope::join("orders", json!({ "order_id": 5 }))));
        assert!(!client.send_raw(&json!({ "action": "ping" })));
        assert_eq!(client.metrics().frames_dropped(), 2);
        assert_eq!(client.metrics().frames_sent(), 0);
    }

    #[test]
    fn test_join_records_intent_while_disconnected() {
        let client = client();
        client.join_exchange_rates_channel("USD", Some("IDR"));
        client.join_adverts_channel("USD", "IDR", AdvertType::Buy);
        assert_eq!(
            client.joined_channels(),
            vec![
                "adverts/currency/USD/IDR/buy".to_string(),
                "exchange_rates/USD/IDR".to_string()
            ]
        );

        client.leave_exchange_rates_channel("USD", Some("IDR"));
        client.leave_adverts_channel("USD", "IDR", AdvertType::Buy);
        assert!(client.joined_channels().is_empty());
    }

    #[test]
    fn test_leave_held_channel_is_not_sent() {
        let client = client();
        client.join_order_channel(1);
        client.join_order_channel(2);
        assert_eq!(client.channel_holders(ORDERS_CHANNEL), 2);

        let dropped_before = client.metrics().frames_dropped();
        assert!(!client.leave_order_channel(1));
        // Released without touching the socket.
        assert_eq!(client.metrics().frames_dropped(), dropped_before);
        assert_eq!(client.channel_holders(ORDERS_CHANNEL), 1);
    }

    #[test]
    fn test_closed_order_chats_are_not_replayed() {
        let client = client();
        client.join_order_channel(1);
        for order_id in 2..=20 {
            client.join_order_channel(order_id);
            client.leave_order_channel(order_id);
        }

        let replay = client.shared.registry.resync_envelopes();
        assert_eq!(replay.len(), client.channel_holders(ORDERS_CHANNEL));
        assert_eq!(replay[0].payload, json!({ "order_id": 1 }));
    }

    #[test]
    fn test_user_updates_bookkeeping() {
        let client = client();
        client.subscribe_to_user_updates();
        assert_eq!(client.channel_holders(USER_CHANNEL), 1);

        client.unsubscribe_from_user_updates();
        assert_eq!(client.channel_holders(USER_CHANNEL), 0);
    }

    #[test]
    fn test_disconnect_when_disconnected_is_noop() {
        let client = client();
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_subscribe_returns_disposer() {
        let client = client();
        let sub = client.subscribe(|_| {});
        assert_eq!(client.subscriber_count(), 1);
        drop(sub);
        assert_eq!(client.subscriber_count(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let client = client();
        let other = client.clone();
        other.join_order_channel(9);
        assert_eq!(client.channel_holders(ORDERS_CHANNEL), 1);
    }

    #[test]
    fn test_hooks_debug() {
        let hooks = LifecycleHooks::new().on_open(|| {}).on_give_up(|_| {});
        let rendered = format!("{hooks:?}");
        assert!(rendered.contains("on_open: true"));
        assert!(rendered.contains("on_close: false"));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let client = ChannelClient::builder(
            WsConfig::new("ws://127.0.0.1:9").with_reconnect(ReconnectPolicy::disabled()),
        )
        .hooks(LifecycleHooks::new().on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .expect("client creation");

        let result = client.connect().await;
        assert!(matches!(result, Err(WsError::Handshake(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(client.metrics().handshake_failures(), 1);
    }
}
