//! Common test utilities for channel client integration tests
//!
//! This module provides:
//! - `MockServer`, a local WebSocket server that records every frame
//! - `HangingServer`, which accepts TCP but never answers the handshake
//! - A `MockServer` variant that never echoes the subprotocol
//! - Helpers for awaiting events with a timeout

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::Message;

/// How long any single wait may take before a test fails.
pub const WAIT: Duration = Duration::from_secs(5);

/// Something the server observed.
#[derive(Debug)]
pub enum ServerEvent {
    /// A client completed the handshake.
    Connected {
        /// The requested subprotocol, if any.
        protocol: Option<String>,
        /// Commands for this connection.
        peer: PeerHandle,
    },
    /// A text frame parsed as JSON.
    Frame(Value),
    /// The client sent a close frame.
    ClientClosed,
}

/// Commands for one server-side connection.
#[derive(Debug)]
enum PeerCommand {
    Send(Message),
    Drop,
}

/// Handle onto one accepted connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    /// Sends a text frame to the client.
    pub fn send_text(&self, text: &str) {
        let _ = self
            .commands
            .send(PeerCommand::Send(Message::Text(text.to_string().into())));
    }

    /// Sends a JSON frame to the client.
    pub fn send_json(&self, value: &Value) {
        self.send_text(&value.to_string());
    }

    /// Starts a close handshake from the server side.
    pub fn close(&self) {
        let _ = self.commands.send(PeerCommand::Send(Message::Close(None)));
    }

    /// Drops the TCP connection without a close frame.
    pub fn kill(&self) {
        let _ = self.commands.send(PeerCommand::Drop);
    }
}

/// A local WebSocket server that records what clients send.
#[derive(Debug)]
pub struct MockServer {
    url: String,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    acceptor: JoinHandle<()>,
    hang: Arc<AtomicBool>,
}

impl MockServer {
    /// Binds to an ephemeral port and starts accepting. The requested
    /// subprotocol is echoed back.
    pub async fn start() -> Self {
        Self::bind(true).await
    }

    /// Like [`start`](Self::start), but the upgrade response never carries
    /// a subprotocol.
    pub async fn start_without_echo() -> Self {
        Self::bind(false).await
    }

    async fn bind(echo: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let (events_tx, events) = mpsc::unbounded_channel();
        let hang = Arc::new(AtomicBool::new(false));

        let hanging = Arc::clone(&hang);
        let acceptor = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                if hanging.load(Ordering::SeqCst) {
                    held.push(stream);
                } else {
                    tokio::spawn(serve_peer(stream, echo, events_tx.clone()));
                }
            }
        });

        Self {
            url: format!("ws://{addr}"),
            events,
            acceptor,
            hang,
        }
    }

    /// New connections are accepted but never get a handshake response.
    /// Existing ones stay up.
    pub fn hang_new_connections(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// The `ws://` URL of the server.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stops accepting new connections. Existing ones stay up.
    pub fn stop_accepting(&self) {
        self.acceptor.abort();
    }

    /// Waits for the next event.
    pub async fn next_event(&mut self) -> ServerEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("server event channel closed")
    }

    /// Waits for the next handshake and returns the protocol and peer.
    pub async fn next_connection(&mut self) -> (Option<String>, PeerHandle) {
        match self.next_event().await {
            ServerEvent::Connected { protocol, peer } => (protocol, peer),
            other => panic!("expected connection, got {other:?}"),
        }
    }

    /// Waits for the next JSON frame.
    pub async fn next_frame(&mut self) -> Value {
        match self.next_event().await {
            ServerEvent::Frame(value) => value,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    /// Waits for `count` JSON frames.
    pub async fn frames(&mut self, count: usize) -> Vec<Value> {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(self.next_frame().await);
        }
        frames
    }

    /// Asserts nothing arrives within `quiet`.
    pub async fn assert_quiet(&mut self, quiet: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(quiet, self.events.recv()).await {
            panic!("unexpected server event: {event:?}");
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn serve_peer(
    stream: tokio::net::TcpStream,
    echo: bool,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut protocol = None;
    let echo_protocol = |request: &Request, mut response: Response| {
        if let Some(requested) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            protocol = requested.to_str().ok().map(str::to_string);
            if echo {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, requested.clone());
            }
        }
        Ok::<Response, ErrorResponse>(response)
    };

    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, echo_protocol).await else {
        return;
    };

    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let _ = events.send(ServerEvent::Connected {
        protocol,
        peer: PeerHandle {
            commands: commands_tx,
        },
    });

    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Send(message)) => {
                    if sink.send(message).await.is_err() {
                        return;
                    }
                }
                Some(PeerCommand::Drop) | None => return,
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str(text.as_str()) {
                        let _ = events.send(ServerEvent::Frame(value));
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    let _ = events.send(ServerEvent::ClientClosed);
                    // tungstenite queues the close reply; flush it.
                    let _ = sink.flush().await;
                    let _ = sink.close().await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            }
        }
    }
}

/// Accepts TCP connections and never completes the handshake.
#[derive(Debug)]
pub struct HangingServer {
    url: String,
    acceptor: JoinHandle<()>,
}

impl HangingServer {
    /// Binds to an ephemeral port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind hanging server");
        let addr = listener.local_addr().expect("local addr");

        let acceptor = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        Self {
            url: format!("ws://{addr}"),
            acceptor,
        }
    }

    /// The `ws://` URL of the server.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for HangingServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

/// Returns a URL on a port nothing listens on.
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind unused port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}")
}

/// Receives from a test channel with the default timeout.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for value")
        .expect("channel closed")
}
