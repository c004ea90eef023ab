//! trellisd — Trellis mesh daemon.
//!
//! Loads (or seeds) the node configuration, brings up a runtime, dials
//! the configured peers, and runs until interrupted. Service
//! implementations are registered by embedders; a bare trellisd is a
//! relay — useful as a mesh hub or root tier.

use anyhow::{Context, Result};

use trellis_core::NodeConfig;
use trellis_runtime::{NodeEvent, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = NodeConfig::write_default_if_missing().context("failed to seed config")?;
    let config = NodeConfig::load().context("failed to load config")?;
    tracing::info!(config = %path.display(), name = %config.friendly_name, "trellisd starting");

    let runtime = Runtime::new(config).context("failed to build runtime")?;
    let addr = runtime.start().await.context("failed to start listener")?;
    tracing::info!(%addr, key = %runtime.public_key_base64()?, "node ready");

    if let Err(e) = runtime.connect_configured_peers().await {
        tracing::error!(error = %e, "initial peer connect failed");
    }

    let mut events = runtime.events();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NodeEvent::PeerConnected { peer }) => tracing::info!(peer, "peer up"),
                Ok(NodeEvent::PeerDisconnected { peer }) => tracing::info!(peer, "peer down"),
                Ok(NodeEvent::ChannelReverted { peer }) => tracing::debug!(peer, "channel reverted"),
                Ok(NodeEvent::ReconnectFailed { peer, error }) => {
                    tracing::warn!(peer, error, "reconnect failed")
                }
                Ok(NodeEvent::InboundCompleted {
                    peer,
                    procedure,
                    duration,
                    error,
                    forwarded,
                    ..
                }) => {
                    tracing::debug!(peer, procedure, ?duration, error, forwarded, "served")
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    tracing::info!("interrupt received");
    runtime.shutdown();
    event_log.abort();
    Ok(())
}
