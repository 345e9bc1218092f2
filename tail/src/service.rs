//! Main tail service.
//!
//! Connects the shared client, joins the configured channels and renders
//! every inbound frame until shut down.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use p2p_realtime_client::session::{NoToken, StaticToken};
use p2p_realtime_client::ws::{
    ChannelClient, ConnectionState, LifecycleHooks, Subscription, WsError,
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::config::{ConfigError, JoinTarget, TailConfig};
use super::printer::render;

/// Errors that stop the tail.
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    /// Bad configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The socket could not be opened.
    #[error("socket error: {0}")]
    Socket(#[from] WsError),

    /// The reconnect policy ran out of attempts.
    #[error("gave up reconnecting after {0} attempts")]
    GaveUp(u32),
}

/// The tail service.
pub struct TailService {
    /// Configuration.
    config: TailConfig,

    /// Parsed channel list.
    targets: Vec<JoinTarget>,

    /// Shared client.
    client: ChannelClient,

    /// Signalled by the give-up hook.
    gave_up: Arc<Notify>,

    /// Attempts reported by the give-up hook.
    attempts: Arc<std::sync::atomic::AtomicU32>,
}

impl TailService {
    /// Creates a new tail service.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: TailConfig) -> Result<Self, TailError> {
        config.validate()?;
        let targets = config.join_targets()?;

        let gave_up = Arc::new(Notify::new());
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hooks = {
            let gave_up = Arc::clone(&gave_up);
            let attempts = Arc::clone(&attempts);
            LifecycleHooks::new()
                .on_open(|| info!("Socket open"))
                .on_close(|close| {
                    if !close.initiated_locally {
                        warn!(code = ?close.code, "Socket lost: {}", close.reason);
                    }
                })
                .on_give_up(move |count| {
                    attempts.store(count, std::sync::atomic::Ordering::Relaxed);
                    gave_up.notify_one();
                })
        };

        let builder = ChannelClient::builder(config.ws_config()).hooks(hooks);
        let client = match &config.token {
            Some(token) => builder.token_source(StaticToken::new(token.clone())),
            None => builder.token_source(NoToken),
        }
        .build()?;

        Ok(Self {
            config,
            targets,
            client,
            gave_up,
            attempts,
        })
    }

    /// Returns the shared client.
    #[must_use]
    pub const fn client(&self) -> &ChannelClient {
        &self.client
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &TailConfig {
        &self.config
    }

    /// Returns the parsed channel list.
    #[must_use]
    pub fn targets(&self) -> &[JoinTarget] {
        &self.targets
    }

    /// Renders every inbound frame into `sink`.
    pub fn watch<W>(&self, sink: W) -> Subscription
    where
        W: Fn(String) + Send + Sync + 'static,
    {
        let format = self.config.output;
        self.client
            .subscribe(move |frame| sink(render(frame, Utc::now(), format)))
    }

    /// Joins every configured channel, then requests push updates if
    /// enabled. Intent is recorded even while the socket is down.
    pub fn join_all(&self) {
        for target in &self.targets {
            debug!(%target, "Joining");
            match target {
                JoinTarget::Order(order_id) => {
                    self.client.join_order_channel(*order_id);
                }
                JoinTarget::Channel(channel) => {
                    self.client.join_channel(&channel.key(), serde_json::json!({}));
                }
            }
        }

        if self.config.user_updates {
            self.client.subscribe_to_user_updates();
        }
    }

    /// Undoes [`join_all`](Self::join_all).
    pub fn leave_all(&self) {
        if self.config.user_updates {
            self.client.unsubscribe_from_user_updates();
        }

        for target in &self.targets {
            match target {
                JoinTarget::Order(order_id) => {
                    self.client.leave_order_channel(*order_id);
                }
                JoinTarget::Channel(channel) => {
                    self.client.leave_channel(&channel.key());
                }
            }
        }
    }

    /// Runs until `shutdown` resolves or the reconnect policy gives up.
    ///
    /// # Errors
    ///
    /// Returns an error if the first connect fails or reconnection is
    /// abandoned.
    pub async fn run<S>(&self, shutdown: S) -> Result<(), TailError>
    where
        S: Future<Output = ()>,
    {
        info!(
            url = %self.config.url,
            channels = self.targets.len(),
            user_updates = self.config.user_updates,
            "Tail service starting"
        );

        self.client.connect().await?;
        self.join_all();

        let outcome = tokio::select! {
            () = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            () = self.gave_up.notified() => {
                let attempts = self.attempts.load(std::sync::atomic::Ordering::Relaxed);
                Err(TailError::GaveUp(attempts))
            }
        };

        self.leave_all();
        self.client.disconnect();
        self.wait_closed().await;

        let metrics = self.client.metrics().snapshot();
        info!(
            received = metrics.frames_received,
            sent = metrics.frames_sent,
            dropped = metrics.frames_dropped,
            malformed = metrics.malformed_frames,
            reconnects = metrics.reconnect_attempts,
            "Tail service stopped"
        );

        outcome
    }

    async fn wait_closed(&self) {
        let mut states = self.client.watch_state();
        let closed = states.wait_for(|state| *state == ConnectionState::Disconnected);
        if tokio::time::timeout(self.client.config().close_timeout, closed)
            .await
            .is_err()
        {
            warn!("Socket did not close in time");
        }
    }
}

impl std::fmt::Debug for TailService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailService")
            .field("url", &self.config.url)
            .field("targets", &self.targets)
            .field("client", &self.client)
            .finish()
    }
}
