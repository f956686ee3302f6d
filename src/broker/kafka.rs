//! Kafka-backed broker
//!
//! Same contract as the in-memory broker, with one difference in meaning:
//! acknowledging a message commits the consumer-group offset of its record.
//! A rejected record is never committed and comes back after a restart or a
//! rebalance.
//!
//! The producer is configured for:
//! - leader-only acknowledgement (`acks=1`)
//! - the configured client-side retry budget (`retries`, `retry.backoff.ms`)
//!
//! The consumer is configured for:
//! - manual offset commits (`enable.auto.commit=false`)
//! - reading from the beginning on first start (`auto.offset.reset=earliest`)
//!
//! Only one consumer per broker instance is supported. `start_consuming`
//! blocks the calling thread and polls with a bounded timeout so that
//! `stop_consuming` takes effect between records, never in the middle of one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::broker::consumer::BrokerConsumer;
use crate::broker::manager::KafkaMessageManager;
use crate::broker::message::MessageEnvelope;
use crate::config::KafkaSettings;
use crate::utils::{BrokerError, Result};

/// Collects delivery failures reported by librdkafka so that `publish` can
/// surface them after flushing.
#[derive(Default)]
pub struct DeliveryTracker {
    failures: Mutex<Vec<KafkaError>>,
}

impl DeliveryTracker {
    fn take_failures(&self) -> Vec<KafkaError> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ClientContext for DeliveryTracker {}

impl ProducerContext for DeliveryTracker {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        if let Err((err, _)) = delivery_result {
            error!(error = %err, "kafka delivery failed");
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(err.clone());
        }
    }
}

type TrackedProducer = BaseProducer<DeliveryTracker>;

/// How long `send` waits for librdkafka to drain its local queue when it is full.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Enqueue every record, waiting out `QueueFull` instead of failing halfway.
fn send_all(
    producer: &TrackedProducer,
    topic: &str,
    records: &[(String, &MessageEnvelope)],
) -> Result<()> {
    for (key, envelope) in records {
        let payload = envelope.encode()?;
        let mut record = BaseRecord::to(topic).key(key.as_str()).payload(&payload);
        loop {
            match producer.send(record) {
                Ok(()) => break,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    debug!(topic, "producer queue full, waiting for deliveries");
                    producer.poll(QUEUE_FULL_BACKOFF);
                    record = returned;
                }
                Err((err, _)) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

/// Send `records`, flush, and report the first delivery failure of this batch.
fn deliver(
    producer: &TrackedProducer,
    topic: &str,
    records: &[(String, &MessageEnvelope)],
    flush_timeout: Timeout,
) -> Result<()> {
    let stale = producer.context().take_failures();
    if !stale.is_empty() {
        warn!(count = stale.len(), "discarding delivery failures of an earlier batch");
    }

    send_all(producer, topic, records)?;
    producer.flush(flush_timeout)?;

    match producer.context().take_failures().into_iter().next() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

pub struct KafkaBroker {
    settings: KafkaSettings,
    producer: Mutex<Option<TrackedProducer>>,
    consumers: Mutex<Vec<BrokerConsumer>>,
    topics: Mutex<HashSet<String>>,
    answer_topics: Mutex<HashSet<String>>,
    interrupted: AtomicBool,
    in_processing: AtomicBool,
    consuming_started: AtomicBool,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KafkaBroker {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            producer: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
            topics: Mutex::new(HashSet::new()),
            answer_topics: Mutex::new(HashSet::new()),
            interrupted: AtomicBool::new(false),
            in_processing: AtomicBool::new(false),
            consuming_started: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &KafkaSettings {
        &self.settings
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming_started.load(Ordering::Acquire)
    }

    pub fn is_processing(&self) -> bool {
        self.in_processing.load(Ordering::Acquire)
    }

    pub fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.bootstrap_servers)
            .set("api.version.request", "true")
            .set("broker.version.fallback", &self.settings.api_version)
            .set("acks", "1")
            .set("retries", self.settings.retries.to_string())
            .set("retry.backoff.ms", self.settings.retry_delay_ms.to_string());
        config
    }

    pub fn consumer_config(&self, group_id: &str, client_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.bootstrap_servers)
            .set("api.version.request", "true")
            .set("broker.version.fallback", &self.settings.api_version)
            .set("group.id", group_id)
            .set("client.id", client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        config
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.poll_timeout_ms)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.connect_timeout_ms)
    }

    fn ensure_topic(&self, topic: &str) -> Result<()> {
        if locked(&self.topics).contains(topic) {
            Ok(())
        } else {
            Err(BrokerError::UnknownTopic(topic.to_string()))
        }
    }

    fn ensure_answer_topic(&self, topic: &str) -> Result<()> {
        if locked(&self.answer_topics).contains(topic) {
            Ok(())
        } else {
            Err(BrokerError::UnknownTopic(topic.to_string()))
        }
    }

    /// Send `records` as `(key, envelope)` pairs and flush once.
    fn produce(&self, topic: &str, records: &[(String, &MessageEnvelope)]) -> Result<()> {
        self.connect()?;
        let guard = locked(&self.producer);
        let producer = guard
            .as_ref()
            .ok_or_else(|| BrokerError::Connection("producer is closed".to_string()))?;

        // delivery is bounded by librdkafka's message.timeout.ms
        deliver(producer, topic, records, Timeout::Never)
    }

    /// Poll once. Timeouts and recoverable client errors yield `None`, only
    /// fatal errors end the caller's loop.
    fn next_record<'c>(
        &self,
        kafka_consumer: &'c BaseConsumer,
    ) -> Result<Option<BorrowedMessage<'c>>> {
        match kafka_consumer.poll(self.poll_timeout()) {
            None => Ok(None),
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(err @ KafkaError::MessageConsumptionFatal(_))) => Err(err.into()),
            Some(Err(err)) => {
                warn!(error = %err, "kafka consumer error, polling again");
                Ok(None)
            }
        }
    }

    fn consume(&self, kafka_consumer: &BaseConsumer, consumer: &BrokerConsumer) -> Result<()> {
        while !self.is_interrupted() {
            let Some(record) = self.next_record(kafka_consumer)? else {
                continue;
            };

            self.in_processing.store(true, Ordering::Release);
            let outcome = (|| -> Result<()> {
                let envelope = MessageEnvelope::decode(record.payload().unwrap_or_default())?;
                debug!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    envelope_id = %envelope.id,
                    "delivering record"
                );
                let mut manager = KafkaMessageManager::new(|| {
                    kafka_consumer.commit_message(&record, CommitMode::Sync)?;
                    Ok(())
                });
                (consumer.message_handler)(envelope, &mut manager).map_err(BrokerError::Handler)
            })();
            self.in_processing.store(false, Ordering::Release);
            outcome?;
        }
        Ok(())
    }

    fn consumer_lag(&self, consumer: &BaseConsumer, topic: &str) -> Result<usize> {
        let metadata = consumer.fetch_metadata(Some(topic), self.connect_timeout())?;
        let mut offsets = TopicPartitionList::new();
        let mut watermarks = Vec::new();
        for meta_topic in metadata.topics().iter().filter(|t| t.name() == topic) {
            for partition in meta_topic.partitions() {
                offsets.add_partition(topic, partition.id());
                let (low, high) =
                    consumer.fetch_watermarks(topic, partition.id(), self.connect_timeout())?;
                watermarks.push((partition.id(), low, high));
            }
        }

        let committed = consumer.committed_offsets(offsets, self.connect_timeout())?;
        let lag = watermarks
            .into_iter()
            .map(|(partition, low, high)| {
                let start = match committed.find_partition(topic, partition).map(|e| e.offset()) {
                    Some(Offset::Offset(offset)) => offset.max(low),
                    _ => low,
                };
                usize::try_from(high - start).unwrap_or(0)
            })
            .sum();
        Ok(lag)
    }
}

impl Broker for KafkaBroker {
    fn connect(&self) -> Result<()> {
        let mut producer = locked(&self.producer);
        if producer.is_some() {
            return Ok(());
        }

        let created: TrackedProducer = self
            .producer_config()
            .create_with_context(DeliveryTracker::default())?;
        created
            .client()
            .fetch_metadata(None, self.connect_timeout())
            .map_err(|err| {
                BrokerError::Connection(format!("{}: {err}", self.settings.bootstrap_servers))
            })?;

        info!(servers = %self.settings.bootstrap_servers, "kafka producer connected");
        *producer = Some(created);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.interrupted.store(true, Ordering::Release);
        if let Some(producer) = locked(&self.producer).take() {
            producer.flush(self.connect_timeout())?;
            info!("kafka producer closed");
        }
        Ok(())
    }

    fn initialize(&self, topics: &[&str], answer_topics: &[&str]) -> Result<()> {
        locked(&self.topics).extend(topics.iter().map(|t| t.to_string()));
        locked(&self.answer_topics).extend(answer_topics.iter().map(|t| t.to_string()));
        Ok(())
    }

    fn add_topic_consumer(&self, consumer: BrokerConsumer) -> Result<()> {
        self.ensure_topic(&consumer.topic)?;
        info!(
            consumer = %consumer.id,
            group = %consumer.group_id,
            topic = %consumer.topic,
            "consumer registered"
        );
        locked(&self.consumers).push(consumer);
        Ok(())
    }

    fn start_consuming(&self) -> Result<()> {
        if self.is_consuming() {
            return Err(BrokerError::AlreadyConsuming);
        }
        let consumer = {
            let consumers = locked(&self.consumers);
            match consumers.len() {
                0 => {
                    warn!("no consumers registered, nothing to consume");
                    return Ok(());
                }
                1 => consumers[0].clone(),
                count => return Err(BrokerError::TooManyConsumers { count }),
            }
        };
        if self.consuming_started.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadyConsuming);
        }

        let result = (|| -> Result<()> {
            let kafka_consumer: BaseConsumer = self
                .consumer_config(&consumer.group_id, &consumer.id)
                .create()?;
            kafka_consumer.subscribe(&[consumer.topic.as_str()])?;
            info!(topic = %consumer.topic, group = %consumer.group_id, "kafka consuming started");

            let consumed = self.consume(&kafka_consumer, &consumer);
            kafka_consumer.unsubscribe();
            consumed
        })();

        // a stop requested before the loop started is honoured, then cleared here
        self.interrupted.store(false, Ordering::Release);
        self.consuming_started.store(false, Ordering::Release);
        info!(topic = %consumer.topic, "kafka consuming stopped");
        result
    }

    fn stop_consuming(&self) {
        self.interrupted.store(true, Ordering::Release);
        if self.is_processing() {
            info!("stop requested, finishing current message first");
        } else {
            info!("stop requested");
        }
    }

    fn publish(&self, topic: &str, envelopes: Vec<MessageEnvelope>) -> Result<()> {
        self.ensure_topic(topic)?;
        let records: Vec<(String, &MessageEnvelope)> =
            envelopes.iter().map(|e| (e.id.to_string(), e)).collect();
        self.produce(topic, &records)?;
        debug!(topic, count = records.len(), "messages published");
        Ok(())
    }

    fn publish_answer(
        &self,
        answer_topic: &str,
        correlation_id: Uuid,
        envelope: MessageEnvelope,
    ) -> Result<()> {
        self.ensure_answer_topic(answer_topic)?;
        self.produce(answer_topic, &[(correlation_id.to_string(), &envelope)])?;
        debug!(answer_topic, %correlation_id, "answer published");
        Ok(())
    }

    fn get_answer(
        &self,
        answer_topic: &str,
        correlation_id: Uuid,
        max_delay: Duration,
    ) -> Result<MessageEnvelope> {
        self.ensure_answer_topic(answer_topic)?;
        let group_id = format!("{answer_topic}__{correlation_id}");
        let kafka_consumer: BaseConsumer = self.consumer_config(&group_id, &group_id).create()?;
        kafka_consumer.subscribe(&[answer_topic])?;

        let key = correlation_id.to_string();
        let deadline = Instant::now() + max_delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::AnswerTimeout {
                    topic: answer_topic.to_string(),
                    correlation_id,
                });
            }
            let record = match kafka_consumer.poll(remaining.min(self.poll_timeout())) {
                None => continue,
                Some(Ok(record)) => record,
                Some(Err(err @ KafkaError::MessageConsumptionFatal(_))) => return Err(err.into()),
                Some(Err(err)) => {
                    warn!(error = %err, answer_topic, "kafka consumer error, polling again");
                    continue;
                }
            };
            if record.key() == Some(key.as_bytes()) {
                return MessageEnvelope::decode(record.payload().unwrap_or_default());
            }
        }
    }

    fn get_topic_approximate_messages_count(&self, topic: &str) -> Result<usize> {
        self.ensure_topic(topic)?;
        let group_id = locked(&self.consumers)
            .iter()
            .find(|c| c.topic == topic)
            .map(|c| c.group_id.clone())
            .ok_or(BrokerError::Unsupported(
                "message count needs a consumer group registered on the topic",
            ))?;
        let kafka_consumer: BaseConsumer = self.consumer_config(&group_id, &group_id).create()?;
        self.consumer_lag(&kafka_consumer, topic)
    }
}

impl std::fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBroker")
            .field("servers", &self.settings.bootstrap_servers)
            .field("consumers", &locked(&self.consumers).len())
            .field("consuming", &self.is_consuming())
            .finish()
    }
}
