//! Line rendering for inbound frames.

use chrono::{DateTime, SecondsFormat, Utc};
use p2p_realtime_client::ws::InboundFrame;
use serde::{Deserialize, Serialize};

/// Output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `<time> <channel> <action> <payload>`.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl OutputFormat {
    /// Parses `text` or `json`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    received_at: String,
    frame: &'a serde_json::Value,
}

/// Renders one frame received at `at`.
#[must_use]
pub fn render(frame: &InboundFrame, at: DateTime<Utc>, format: OutputFormat) -> String {
    let received_at = at.to_rfc3339_opts(SecondsFormat::Millis, true);
    match format {
        OutputFormat::Text => {
            let payload = frame
                .payload()
                .map_or_else(|| frame.value().to_string(), ToString::to_string);
            format!(
                "{} {} {} {}",
                received_at,
                frame.channel().unwrap_or("-"),
                frame.action().unwrap_or("-"),
                payload
            )
        }
        OutputFormat::Json => {
            let line = JsonLine {
                received_at,
                frame: frame.value(),
            };
            serde_json::to_string(&line).unwrap_or_else(|_| frame.value().to_string())
        }
    }
}
