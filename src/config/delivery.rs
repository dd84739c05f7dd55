//! Publish, consume and dead-letter tuning.

use std::time::Duration;

use serde::Deserialize;

/// Publisher retry settings (`publish.*`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Fixed delay between attempts.
    pub retry_delay_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 1000,
        }
    }
}

impl PublishConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Consumer worker pool settings (`consumer.*`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Worker tasks per subscribed topic.
    pub workers: usize,
    /// Capacity of the delivery channel between broker and workers.
    pub channel_capacity: usize,
    /// Deliveries before the broker moves a message to the dead-letter topic.
    pub max_deliveries: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            channel_capacity: 2000,
            max_deliveries: 10,
        }
    }
}

/// Dead-letter reprocessing settings (`dlq.*`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Stop draining once no message arrives for this long.
    pub idle_timeout_ms: u64,
    pub channel_capacity: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 5000,
            channel_capacity: 100,
        }
    }
}

impl DlqConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
