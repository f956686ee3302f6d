//! Broker abstraction
//!
//! A `Broker` decouples message producers from consumers: producers
//! `publish` envelopes to named topics, consumers are registered per topic and
//! receive every envelope together with a `MessageManager` that they use to
//! acknowledge or reject it. Delivery is at-least-once.
//!
//! Backends:
//! - [`MemoryBroker`]: in-process, synchronous and deterministic
//! - [`KafkaBroker`]: backed by a Kafka cluster, acknowledgement commits offsets

pub mod consumer;
pub mod kafka;
pub mod manager;
pub mod memory;
pub mod message;
pub mod topic;

use std::thread;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

pub use consumer::{BrokerConsumer, MessageHandler};
pub use kafka::KafkaBroker;
pub use manager::MessageManager;
pub use memory::MemoryBroker;
pub use message::MessageEnvelope;

use crate::config::{BrokerKind, Settings};
use crate::utils::{BrokerError, Result};

pub trait Broker: Send + Sync {
    /// Establish or validate the underlying transport.
    fn connect(&self) -> Result<()>;

    /// Release transport resources.
    fn close(&self) -> Result<()>;

    /// Prepare per-topic state. Topics must be initialized before they are
    /// published to or consumed from.
    fn initialize(&self, topics: &[&str], answer_topics: &[&str]) -> Result<()>;

    fn add_topic_consumer(&self, consumer: BrokerConsumer) -> Result<()>;

    /// Deliver messages to the registered consumers. Blocks the caller.
    fn start_consuming(&self) -> Result<()>;

    /// Ask a running `start_consuming` loop to return once the message in
    /// progress is settled.
    fn stop_consuming(&self);

    fn publish(&self, topic: &str, envelopes: Vec<MessageEnvelope>) -> Result<()>;

    fn publish_answer(
        &self,
        answer_topic: &str,
        correlation_id: Uuid,
        envelope: MessageEnvelope,
    ) -> Result<()>;

    /// Wait up to `max_delay` for the answer correlated with `correlation_id`.
    fn get_answer(
        &self,
        answer_topic: &str,
        correlation_id: Uuid,
        max_delay: Duration,
    ) -> Result<MessageEnvelope>;

    fn get_topic_approximate_messages_count(&self, topic: &str) -> Result<usize>;
}

/// Build the backend selected in `settings`.
pub fn from_settings(settings: &Settings) -> Box<dyn Broker> {
    match settings.broker.kind {
        BrokerKind::Memory => Box::new(MemoryBroker::new()),
        BrokerKind::Kafka => Box::new(KafkaBroker::new(settings.kafka.clone())),
    }
}

/// Call `connect` until it succeeds, retrying only on connection errors.
pub fn connect_with_retry(
    broker: &dyn Broker,
    retry_max_count: u32,
    retry_delay: Duration,
) -> Result<()> {
    let attempts = retry_max_count.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match broker.connect() {
            Ok(()) => {
                info!(attempt, "broker connected");
                return Ok(());
            }
            Err(err) if err.is_connection() => {
                warn!(attempt, attempts, error = %err, "broker connection failed, retrying");
                last_error = Some(err);
                if attempt < attempts {
                    thread::sleep(retry_delay);
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(BrokerError::Connection(format!(
        "unavailable after {attempts} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests;
