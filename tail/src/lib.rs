//! P2P Tail - operator tool for the realtime socket.
//!
//! Connects the shared channel client, joins the channels named in its
//! environment and prints every inbound frame with a receive timestamp.
//!
//! # Components
//!
//! - [`config`]: Tail configuration
//! - [`printer`]: Frame rendering
//! - [`service`]: Main tail service

pub mod config;
pub mod printer;
pub mod service;

pub use config::{ConfigError, JoinTarget, TailConfig};
pub use printer::{render, OutputFormat};
pub use service::{TailError, TailService};
