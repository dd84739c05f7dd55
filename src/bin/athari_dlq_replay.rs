//! athari-dlq-replay: move dead-lettered messages back to their topic.
//!
//! Usage: `athari-dlq-replay <dlq_topic> <target_topic> [max_messages]`
//!
//! Connection settings come from the usual configuration sources
//! (`config.yaml`, ATHARI__*, PULSAR.URL, APP.SERVICE.NAME). Prints the
//! number of messages republished.

use std::sync::Arc;

use tracing::info;

use athari_events::broker::PulsarConnector;
use athari_events::utils::bootstrap::init_tracing;
use athari_events::{Config, EventClient};

const DEFAULT_MAX_MESSAGES: usize = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(dlq_topic), Some(target_topic)) = (args.next(), args.next()) else {
        return Err("usage: athari-dlq-replay <dlq_topic> <target_topic> [max_messages]".into());
    };
    let max_messages = match args.next() {
        Some(max) => max.parse()?,
        None => DEFAULT_MAX_MESSAGES,
    };

    let client = EventClient::new(Config::load(None)?, Arc::new(PulsarConnector));
    client.connect().await?;

    let processed = client
        .process_dlq_messages(&dlq_topic, &target_topic, max_messages)
        .await?;

    info!(
        dlq_topic = %dlq_topic,
        target_topic = %target_topic,
        processed,
        "Replay finished"
    );
    println!("{}", processed);

    client.close().await;
    Ok(())
}
