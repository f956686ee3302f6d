//! In-memory broker
//!
//! This module contains the in-process broker implementation responsible for:
//! - keeping one `TopicQueue` per initialized topic
//! - registering consumer callbacks on those queues
//! - draining every queue into its listeners on `start_consuming`
//! - dispatching immediately on `publish` once consuming has started
//! - holding answers for request/response exchanges
//!
//! Concurrency and usage notes:
//! - Dispatch is synchronous. Callbacks run on the thread that called
//!   `start_consuming` or `publish`, and topics are drained one after the
//!   other in initialization order.
//! - Internal locks are never held across a callback, so callbacks may
//!   publish to the same broker re-entrantly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::broker::consumer::BrokerConsumer;
use crate::broker::message::MessageEnvelope;
use crate::broker::topic::TopicQueue;
use crate::utils::{BrokerError, Result};

#[derive(Debug, Default)]
struct Topics {
    order: Vec<String>,
    queues: HashMap<String, Arc<TopicQueue>>,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    topics: Mutex<Topics>,
    answers: Mutex<HashMap<String, HashMap<Uuid, MessageEnvelope>>>,
    answer_ready: Condvar,
    consumers_count: AtomicUsize,
    consuming_started: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answers(&self) -> MutexGuard<'_, HashMap<String, HashMap<Uuid, MessageEnvelope>>> {
        self.answers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue(&self, topic: &str) -> Result<Arc<TopicQueue>> {
        self.topics()
            .queues
            .get(topic)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    pub fn consumers_count(&self) -> usize {
        self.consumers_count.load(Ordering::Acquire)
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming_started.load(Ordering::Acquire)
    }
}

impl Broker for MemoryBroker {
    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn initialize(&self, topics: &[&str], answer_topics: &[&str]) -> Result<()> {
        {
            let mut registered = self.topics();
            for &topic in topics {
                if registered.queues.contains_key(topic) {
                    warn!(topic, "topic already initialized, keeping existing queue");
                    continue;
                }
                registered
                    .queues
                    .insert(topic.to_string(), Arc::new(TopicQueue::new(topic)));
                registered.order.push(topic.to_string());
                debug!(topic, "topic initialized");
            }
        }

        let mut answers = self.answers();
        for &topic in answer_topics {
            answers.entry(topic.to_string()).or_default();
        }
        Ok(())
    }

    fn add_topic_consumer(&self, consumer: BrokerConsumer) -> Result<()> {
        let queue = self.queue(&consumer.topic)?;
        let listener_id = queue.add_listener(consumer.message_handler.clone(), consumer.prefetch);
        let count = self.consumers_count.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            consumer = %consumer.id,
            group = %consumer.group_id,
            topic = %consumer.topic,
            prefetch = consumer.prefetch,
            listener_id,
            consumers = count,
            "consumer registered"
        );
        Ok(())
    }

    fn start_consuming(&self) -> Result<()> {
        if self.consuming_started.load(Ordering::Acquire) {
            return Err(BrokerError::AlreadyConsuming);
        }
        if self.consumers_count() == 0 {
            warn!("no consumers registered, nothing to consume");
            return Ok(());
        }
        if self.consuming_started.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadyConsuming);
        }

        let queues: Vec<Arc<TopicQueue>> = {
            let topics = self.topics();
            topics
                .order
                .iter()
                .filter_map(|name| topics.queues.get(name).cloned())
                .collect()
        };

        for queue in queues {
            debug!(topic = queue.name(), "draining topic");
            queue.process_all()?;
        }
        Ok(())
    }

    fn stop_consuming(&self) {
        debug!("stop requested, in-memory dispatch always runs to completion");
    }

    fn publish(&self, topic: &str, envelopes: Vec<MessageEnvelope>) -> Result<()> {
        let queue = self.queue(topic)?;
        for envelope in envelopes {
            let message_id = queue.add(envelope);
            debug!(topic, message_id, "message published");
        }

        if self.is_consuming() {
            queue.process_all()?;
        }
        Ok(())
    }

    fn publish_answer(
        &self,
        answer_topic: &str,
        correlation_id: Uuid,
        envelope: MessageEnvelope,
    ) -> Result<()> {
        let mut answers = self.answers();
        let slots = answers
            .get_mut(answer_topic)
            .ok_or_else(|| BrokerError::UnknownTopic(answer_topic.to_string()))?;
        slots.insert(correlation_id, envelope);
        self.answer_ready.notify_all();
        debug!(answer_topic, %correlation_id, "answer published");
        Ok(())
    }

    fn get_answer(
        &self,
        answer_topic: &str,
        correlation_id: Uuid,
        max_delay: Duration,
    ) -> Result<MessageEnvelope> {
        let answers = self.answers();
        if !answers.contains_key(answer_topic) {
            return Err(BrokerError::UnknownTopic(answer_topic.to_string()));
        }

        let (mut answers, _) = self
            .answer_ready
            .wait_timeout_while(answers, max_delay, |answers| {
                !answers
                    .get(answer_topic)
                    .is_some_and(|slots| slots.contains_key(&correlation_id))
            })
            .unwrap_or_else(PoisonError::into_inner);

        answers
            .get_mut(answer_topic)
            .and_then(|slots| slots.remove(&correlation_id))
            .ok_or_else(|| BrokerError::AnswerTimeout {
                topic: answer_topic.to_string(),
                correlation_id,
            })
    }

    fn get_topic_approximate_messages_count(&self, topic: &str) -> Result<usize> {
        Ok(self.queue(topic)?.messages_to_process_count())
    }
}
