//! Per-message acknowledgement handles
//!
//! Every delivery hands the consumer callback a fresh `MessageManager`. The
//! callback settles the message exactly once: `ack` finalizes it, `reject`
//! gives it back to the broker. Repeated or stale calls are harmless.

use std::sync::Arc;

use tracing::debug;

use crate::broker::topic::{MessageId, TopicQueue};
use crate::utils::Result;

pub trait MessageManager {
    fn ack(&mut self) -> Result<()>;
    fn reject(&mut self) -> Result<()>;
}

/// Manager for the in-memory backend, bound to one reservation of one queue.
pub struct MemoryMessageManager {
    queue: Arc<TopicQueue>,
    message_id: MessageId,
}

impl MemoryMessageManager {
    pub fn new(queue: Arc<TopicQueue>, message_id: MessageId) -> Self {
        Self { queue, message_id }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

impl MessageManager for MemoryMessageManager {
    fn ack(&mut self) -> Result<()> {
        self.queue.mark_as_processed(self.message_id);
        Ok(())
    }

    fn reject(&mut self) -> Result<()> {
        self.queue.move_back_from_reserved(self.message_id);
        Ok(())
    }
}

/// Manager for the Kafka backend. `ack` runs the bound offset commit at most
/// once; `reject` leaves the offset uncommitted so the record is redelivered
/// after a restart or rebalance.
pub struct KafkaMessageManager<'a> {
    commit: Box<dyn FnMut() -> Result<()> + 'a>,
    committed: bool,
}

impl<'a> KafkaMessageManager<'a> {
    pub fn new<F>(commit: F) -> Self
    where
        F: FnMut() -> Result<()> + 'a,
    {
        Self {
            commit: Box::new(commit),
            committed: false,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

impl MessageManager for KafkaMessageManager<'_> {
    fn ack(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        (self.commit)()?;
        self.committed = true;
        Ok(())
    }

    fn reject(&mut self) -> Result<()> {
        debug!("reject on kafka record is a no-op, offset stays uncommitted");
        Ok(())
    }
}
