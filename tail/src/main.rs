//! P2P Tail binary.
//!
//! Entry point for the tool that prints every frame on the realtime socket.

use p2p_tail::{TailConfig, TailService};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,p2p_realtime_client=debug,p2p_tail=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration from environment
    let config = TailConfig::from_env()?;

    tracing::info!("Starting P2P Tail");
    tracing::info!("Socket URL: {}", config.url);
    tracing::info!("Authenticated: {}", config.token.is_some());
    tracing::info!("Channels: {:?}", config.channels);

    let service = TailService::new(config)?;
    let _printer = service.watch(|line| println!("{line}"));

    service
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
