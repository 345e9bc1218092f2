//! Inbound frame routing.
//!
//! Parses text frames and hands them to every subscriber. Nothing here is
//! allowed to fail outward: bad JSON is logged and dropped, panicking
//! subscribers are isolated by the [`SubscriberSet`].

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::messages::InboundFrame;
use super::metrics::ClientMetrics;
use super::subscribers::{Delivery, SubscriberSet, Subscription};

/// What became of one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Parsed and delivered.
    Delivered(Delivery),
    /// Not JSON; dropped.
    Malformed,
}

/// Fans parsed frames out to subscribers.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    subscribers: SubscriberSet<InboundFrame>,
    metrics: Arc<ClientMetrics>,
}

impl MessageRouter {
    /// Creates a router reporting into `metrics`.
    #[must_use]
    pub fn new(metrics: Arc<ClientMetrics>) -> Self {
        Self {
            subscribers: SubscriberSet::new(),
            metrics,
        }
    }

    /// Registers a subscriber for every inbound frame.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Routes one text frame.
    pub fn route_text(&self, text: &str) -> RouteOutcome {
        self.metrics.record_frame_received();

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.record_malformed_frame();
                error!("Dropping malformed inbound frame: {}", e);
                return RouteOutcome::Malformed;
            }
        };

        debug!(
            action = frame.action().unwrap_or("unknown"),
            channel = frame.channel().unwrap_or("-"),
            "Inbound frame"
        );

        let delivery = self.subscribers.publish(&frame);
        if delivery.failed > 0 {
            self.metrics.record_subscriber_failures(delivery.failed as u64);
            warn!(
                "{} of {} subscribers failed on inbound frame",
                delivery.failed,
                delivery.failed + delivery.delivered
            );
        }
        RouteOutcome::Delivered(delivery)
    }

    /// Routes one binary frame, which must hold UTF-8 JSON text.
    pub fn route_binary(&self, data: &[u8]) -> RouteOutcome {
        match std::str::from_utf8(data) {
            Ok(text) => self.route_text(text),
            Err(e) => {
                self.metrics.record_frame_received();
                self.metrics.record_malformed_frame();
                error!("Dropping non-UTF-8 binary frame: {}", e);
                RouteOutcome::Malformed
            }
        }
    }
}
