//! Per-topic queue for the in-memory broker
//!
//! A `TopicQueue` buffers messages for one topic in strict FIFO order and
//! hands them out one reservation at a time. A message is always in exactly
//! one of three states: waiting, reserved, or processed (gone). Rejected
//! messages go back to the front of the waiting line.
//!
//! Concurrency note: state lives behind `Mutex`es so that managers and
//! re-entrant `publish` calls can reach the queue while a listener callback
//! runs. No lock is held across a callback.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::broker::consumer::MessageHandler;
use crate::broker::manager::MemoryMessageManager;
use crate::broker::message::MessageEnvelope;
use crate::utils::{BrokerError, Result};

pub type MessageId = u64;
pub type ListenerId = u64;

#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<(MessageId, MessageEnvelope)>,
    reserved: Option<(MessageId, MessageEnvelope)>,
    next_message_id: MessageId,
}

struct Listener {
    handler: MessageHandler,
    prefetch: usize,
}

#[derive(Default)]
struct ListenerRegistry {
    next_listener_id: ListenerId,
    listeners: BTreeMap<ListenerId, Listener>,
}

pub struct TopicQueue {
    name: String,
    state: Mutex<QueueState>,
    registry: Mutex<ListenerRegistry>,
    dispatching: AtomicBool,
}

/// Clears the dispatch flag even if a callback unwinds.
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TopicQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            registry: Mutex::new(ListenerRegistry::default()),
            dispatching: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, ListenerRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message to the waiting line and return its id.
    pub fn add(&self, envelope: MessageEnvelope) -> MessageId {
        let mut state = self.state();
        let message_id = state.next_message_id;
        state.next_message_id += 1;
        state.waiting.push_back((message_id, envelope));
        message_id
    }

    /// Reserve the head of the waiting line. While a reservation is open the
    /// same message is returned again. `None` when nothing is left.
    pub fn reserve_next(&self) -> Option<(MessageId, MessageEnvelope)> {
        let mut state = self.state();
        if state.reserved.is_none() {
            state.reserved = state.waiting.pop_front();
        }
        state.reserved.clone()
    }

    /// Reject path. Returns `false` for a stale id.
    pub fn move_back_from_reserved(&self, message_id: MessageId) -> bool {
        let mut state = self.state();
        match state.reserved.take() {
            Some(entry) if entry.0 == message_id => {
                state.waiting.push_front(entry);
                debug!(topic = %self.name, message_id, "message moved back to queue");
                true
            }
            other => {
                state.reserved = other;
                false
            }
        }
    }

    /// Ack path. Returns `false` for a stale id.
    pub fn mark_as_processed(&self, message_id: MessageId) -> bool {
        let mut state = self.state();
        match state.reserved.take() {
            Some((reserved_id, _)) if reserved_id == message_id => {
                debug!(topic = %self.name, message_id, "message processed");
                true
            }
            other => {
                state.reserved = other;
                false
            }
        }
    }

    pub fn reserved_id(&self) -> Option<MessageId> {
        self.state().reserved.as_ref().map(|(id, _)| *id)
    }

    pub fn add_listener(&self, handler: MessageHandler, prefetch: usize) -> ListenerId {
        let mut registry = self.registry();
        let listener_id = registry.next_listener_id;
        registry.next_listener_id += 1;
        registry.listeners.insert(
            listener_id,
            Listener {
                handler,
                prefetch: prefetch.max(1),
            },
        );
        listener_id
    }

    pub fn rm_listener(&self, listener_id: ListenerId) -> bool {
        self.registry().listeners.remove(&listener_id).is_some()
    }

    pub fn listeners_count(&self) -> usize {
        self.registry().listeners.len()
    }

    pub fn messages_to_process_count(&self) -> usize {
        let state = self.state();
        state.waiting.len() + usize::from(state.reserved.is_some())
    }

    pub fn has_messages_to_process(&self) -> bool {
        self.messages_to_process_count() > 0
    }

    fn listener(&self, listener_id: ListenerId) -> Option<(MessageHandler, usize)> {
        self.registry()
            .listeners
            .get(&listener_id)
            .map(|l| (Arc::clone(&l.handler), l.prefetch))
    }

    fn listener_ids(&self) -> Vec<ListenerId> {
        self.registry().listeners.keys().copied().collect()
    }

    /// Drain the queue into the registered listeners.
    ///
    /// Each round walks the listeners in registration order and hands each
    /// up to `prefetch` messages. Rounds repeat until the queue is empty or
    /// no listener is left. A nested call made from inside a callback returns
    /// immediately; the running loop picks up whatever was published.
    pub fn process_all(self: &Arc<Self>) -> Result<()> {
        if self.dispatching.swap(true, Ordering::AcqRel) {
            debug!(topic = %self.name, "dispatch already running");
            return Ok(());
        }
        let _guard = DispatchGuard(&self.dispatching);

        while self.has_messages_to_process() {
            let listener_ids = self.listener_ids();
            if listener_ids.is_empty() {
                break;
            }

            for listener_id in listener_ids {
                let Some((handler, prefetch)) = self.listener(listener_id) else {
                    continue;
                };

                for _ in 0..prefetch {
                    if self.listener(listener_id).is_none() {
                        break;
                    }
                    let Some((message_id, envelope)) = self.reserve_next() else {
                        break;
                    };

                    debug!(topic = %self.name, message_id, listener_id, envelope_id = %envelope.id, "delivering message");
                    let mut manager = MemoryMessageManager::new(Arc::clone(self), message_id);
                    handler(envelope, &mut manager).map_err(BrokerError::Handler)?;

                    if self.reserved_id() == Some(message_id) {
                        return Err(BrokerError::UnsettledMessage {
                            topic: self.name.clone(),
                            message_id,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for TopicQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicQueue")
            .field("name", &self.name)
            .field("messages", &self.messages_to_process_count())
            .field("listeners", &self.listeners_count())
            .finish()
    }
}
