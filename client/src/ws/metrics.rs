//! Client metrics tracking.
//!
//! Provides atomic counters for monitoring the shared connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for the channel client.
#[derive(Debug)]
pub struct ClientMetrics {
    /// Sockets that reached `Open`.
    connections_opened: AtomicU64,

    /// Sockets that closed after being open.
    connections_closed: AtomicU64,

    /// Handshakes that failed.
    handshake_failures: AtomicU64,

    /// Reconnect attempts made by the policy.
    reconnect_attempts: AtomicU64,

    /// Frames written to the socket.
    frames_sent: AtomicU64,

    /// Frames dropped because the socket was not open or the buffer was full.
    frames_dropped: AtomicU64,

    /// Text frames received.
    frames_received: AtomicU64,

    /// Received frames that were not JSON.
    malformed_frames: AtomicU64,

    /// Subscriber callbacks that panicked.
    subscriber_failures: AtomicU64,

    /// Creation time.
    start_time: Instant,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMetrics {
    /// Creates a new metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            subscriber_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records a socket reaching `Open`.
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an open socket closing.
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed handshake.
    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reconnect attempt.
    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a frame written.
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a frame dropped.
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a frame received.
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a frame that failed to parse.
    pub fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `count` subscriber panics.
    pub fn record_subscriber_failures(&self, count: u64) {
        self.subscriber_failures.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns the sockets opened.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    /// Returns the sockets closed.
    #[must_use]
    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    /// Returns the failed handshakes.
    #[must_use]
    pub fn handshake_failures(&self) -> u64 {
        self.handshake_failures.load(Ordering::Relaxed)
    }

    /// Returns the reconnect attempts.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Returns the frames sent.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Returns the frames dropped.
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Returns the frames received.
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Returns the malformed frames.
    #[must_use]
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Returns the subscriber panics.
    #[must_use]
    pub fn subscriber_failures(&self) -> u64 {
        self.subscriber_failures.load(Ordering::Relaxed)
    }

    /// Returns the uptime.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            connections_opened: self.connections_opened(),
            connections_closed: self.connections_closed(),
            handshake_failures: self.handshake_failures(),
            reconnect_attempts: self.reconnect_attempts(),
            frames_sent: self.frames_sent(),
            frames_dropped: self.frames_dropped(),
            frames_received: self.frames_received(),
            malformed_frames: self.malformed_frames(),
            subscriber_failures: self.subscriber_failures(),
            uptime: self.uptime(),
        }
    }
}

/// A point-in-time snapshot of client metrics.
#[derive(Debug, Clone)]
pub struct ClientMetricsSnapshot {
    /// Sockets opened.
    pub connections_opened: u64,
    /// Sockets closed.
    pub connections_closed: u64,
    /// Failed handshakes.
    pub handshake_failures: u64,
    /// Reconnect attempts.
    pub reconnect_attempts: u64,
    /// Frames sent.
    pub frames_sent: u64,
    /// Frames dropped.
    pub frames_dropped: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Malformed frames.
    pub malformed_frames: u64,
    /// Subscriber panics.
    pub subscriber_failures: u64,
    /// Uptime.
    pub uptime: Duration,
}
