//! athari-listen: log every event on the configured topics.
//!
//! ## Configuration
//! - PULSAR.URL / ATHARI__PULSAR__URL: broker URL
//! - APP.SERVICE.NAME: service name (also the subscription name)
//! - EVENT_TOPICS: comma-separated topics to consume
//! - PULSAR.PUBKEY, PULSAR.PRIVKEY, PULSAR.ENCRYPTION.KEY: optional key material
//!
//! Runs until Ctrl-C, then drains in-flight messages and exits.

use std::sync::Arc;

use tracing::{error, info};

use athari_events::broker::PulsarConnector;
use athari_events::handlers::LoggingHandler;
use athari_events::utils::bootstrap::init_tracing;
use athari_events::{Config, EventClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let client = EventClient::new(config, Arc::new(PulsarConnector));

    if let Err(e) = client.connect().await {
        error!(error = %e, "Failed to connect to broker");
        return Err(e.into());
    }

    let topics = client.topics()?;
    let subscription = client
        .config()
        .service_name()
        .unwrap_or("athari-listen")
        .to_string();

    let listeners = client
        .listen_on_topics(
            &topics,
            &subscription,
            Arc::new(LoggingHandler::new("athari-listen")),
        )
        .await?;

    info!(topics = ?topics, subscription = %subscription, "athari-listen started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    listeners.shutdown().await;
    client.close().await;

    Ok(())
}
