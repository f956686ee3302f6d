//! The `error` module defines the error types shared by every broker backend.
//!
//! Configuration mistakes (double start, too many consumers, unknown topic)
//! surface immediately as a `BrokerError`. Stale acknowledgements are not
//! errors and never reach this type.

use rdkafka::error::KafkaError;
use thiserror::Error;
use uuid::Uuid;

/// Error returned by a consumer callback. It is carried out of the dispatch
/// loop unchanged inside [`BrokerError::Handler`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("consuming was already started")]
    AlreadyConsuming,

    #[error("kafka broker supports exactly one consumer, {count} registered")]
    TooManyConsumers { count: usize },

    #[error("topic '{0}' was not initialized")]
    UnknownTopic(String),

    #[error("message {message_id} on topic '{topic}' was neither acked nor rejected")]
    UnsettledMessage { topic: String, message_id: u64 },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("message handler failed: {0}")]
    Handler(HandlerError),

    #[error("no answer on '{topic}' for {correlation_id}")]
    AnswerTimeout { topic: String, correlation_id: Uuid },

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl BrokerError {
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
