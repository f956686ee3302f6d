//! Consumer descriptor
//!
//! A `BrokerConsumer` tells a broker which callback to drive for a topic and
//! how many messages the callback may be handed per dispatch round.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::broker::manager::MessageManager;
use crate::broker::message::MessageEnvelope;
use crate::utils::HandlerError;

/// Callback invoked for every delivered envelope. It must settle the message
/// through the manager (`ack` or `reject`) before returning.
pub type MessageHandler =
    Arc<dyn Fn(MessageEnvelope, &mut dyn MessageManager) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Clone)]
pub struct BrokerConsumer {
    pub id: String,
    pub group_id: String,
    pub topic: String,
    pub prefetch: usize,
    pub message_handler: MessageHandler,
}

impl BrokerConsumer {
    pub fn new<F>(topic: &str, group_id: &str, handler: F) -> Self
    where
        F: Fn(MessageEnvelope, &mut dyn MessageManager) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: format!("{group_id}__{}", Uuid::new_v4()),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            prefetch: 1,
            message_handler: Arc::new(handler),
        }
    }

    /// Set the per-round prefetch. Values below 1 are raised to 1.
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

impl fmt::Debug for BrokerConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConsumer")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .field("topic", &self.topic)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}
