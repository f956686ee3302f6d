use super::{
    Broker, BrokerConsumer, MemoryBroker, MessageEnvelope, MessageHandler, MessageManager,
    connect_with_retry,
};
use crate::broker::topic::TopicQueue;
use crate::utils::{BrokerError, HandlerError, Result};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

type Log = Arc<Mutex<Vec<(Value, &'static str)>>>;

fn envelope(payload: Value) -> MessageEnvelope {
    MessageEnvelope::new(payload)
}

fn acking_consumer(topic: &str, log: Log) -> BrokerConsumer {
    BrokerConsumer::new(topic, "workers", move |env, manager| {
        manager.ack()?;
        log.lock().unwrap().push((env.payload, "ack"));
        Ok(())
    })
}

fn handler<F>(f: F) -> MessageHandler
where
    F: Fn(MessageEnvelope, &mut dyn MessageManager) -> std::result::Result<(), HandlerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

fn broker_with(topics: &[&str]) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.initialize(topics, &[]).unwrap();
    broker
}

fn payloads(log: &Log) -> Vec<Value> {
    log.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
}

#[test]
fn test_queue_add_assigns_increasing_ids() {
    let queue = TopicQueue::new("t1");
    let first = queue.add(envelope(json!("a")));
    let second = queue.add(envelope(json!("b")));
    assert!(second > first);
    assert_eq!(queue.messages_to_process_count(), 2);
}

#[test]
fn test_queue_reserve_is_reentrant() {
    let queue = TopicQueue::new("t1");
    queue.add(envelope(json!("a")));
    queue.add(envelope(json!("b")));

    let (first, env_a) = queue.reserve_next().unwrap();
    let (again, env_again) = queue.reserve_next().unwrap();

    assert_eq!(first, again);
    assert_eq!(env_a, env_again);
    assert_eq!(queue.reserved_id(), Some(first));
    assert_eq!(queue.messages_to_process_count(), 2);
}

#[test]
fn test_queue_reserve_on_empty_returns_none() {
    let queue = TopicQueue::new("t1");
    assert!(queue.reserve_next().is_none());
    assert!(!queue.has_messages_to_process());
}

#[test]
fn test_queue_reject_requeues_to_front() {
    let queue = TopicQueue::new("t1");
    queue.add(envelope(json!("a")));
    queue.add(envelope(json!("b")));

    let (id_a, _) = queue.reserve_next().unwrap();
    assert!(queue.move_back_from_reserved(id_a));

    let (next, env) = queue.reserve_next().unwrap();
    assert_eq!(next, id_a);
    assert_eq!(env.payload, json!("a"));
}

#[test]
fn test_queue_stale_ids_are_ignored() {
    let queue = TopicQueue::new("t1");
    queue.add(envelope(json!("a")));
    let (id_a, _) = queue.reserve_next().unwrap();

    assert!(!queue.mark_as_processed(id_a + 1));
    assert!(!queue.move_back_from_reserved(id_a + 1));
    assert_eq!(queue.reserved_id(), Some(id_a));

    assert!(queue.mark_as_processed(id_a));
    assert!(!queue.mark_as_processed(id_a));
    assert!(!queue.has_messages_to_process());
}

#[test]
fn test_queue_rm_listener() {
    let queue = TopicQueue::new("t1");
    let id = queue.add_listener(
        handler(|_, manager| {
            manager.ack()?;
            Ok(())
        }),
        1,
    );
    assert_eq!(queue.listeners_count(), 1);
    assert!(queue.rm_listener(id));
    assert!(!queue.rm_listener(id));
    assert_eq!(queue.listeners_count(), 0);
}

#[test]
fn test_queue_prefetch_rounds_across_listeners() {
    let queue = Arc::new(TopicQueue::new("t1"));
    let log: Arc<Mutex<Vec<(&'static str, Value)>>> = Arc::new(Mutex::new(Vec::new()));

    for (name, prefetch) in [("first", 2), ("second", 1)] {
        let log = Arc::clone(&log);
        queue.add_listener(
            handler(move |env, manager| {
                manager.ack()?;
                log.lock().unwrap().push((name, env.payload));
                Ok(())
            }),
            prefetch,
        );
    }
    for p in ["a", "b", "c", "d", "e"] {
        queue.add(envelope(json!(p)));
    }

    queue.process_all().unwrap();

    let seen: Vec<(&str, Value)> = log.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("first", json!("a")),
            ("first", json!("b")),
            ("second", json!("c")),
            ("first", json!("d")),
            ("first", json!("e")),
        ]
    );
    assert!(!queue.has_messages_to_process());
}

#[test]
fn test_queue_removed_listener_gets_nothing() {
    let queue = Arc::new(TopicQueue::new("t1"));
    let removed_calls = Arc::new(AtomicU32::new(0));
    let calls = Arc::clone(&removed_calls);
    let removed = queue.add_listener(
        handler(move |_, manager| {
            calls.fetch_add(1, Ordering::SeqCst);
            manager.ack()?;
            Ok(())
        }),
        1,
    );
    queue.add_listener(
        handler(|_, manager| {
            manager.ack()?;
            Ok(())
        }),
        1,
    );
    queue.add(envelope(json!(1)));
    queue.add(envelope(json!(2)));

    queue.rm_listener(removed);
    queue.process_all().unwrap();

    assert_eq!(removed_calls.load(Ordering::SeqCst), 0);
    assert!(!queue.has_messages_to_process());
}

#[test]
fn test_queue_without_listeners_keeps_messages() {
    let queue = Arc::new(TopicQueue::new("t1"));
    queue.add(envelope(json!(1)));
    queue.process_all().unwrap();
    assert_eq!(queue.messages_to_process_count(), 1);
}

#[test]
fn test_broker_fifo_delivery() {
    let broker = broker_with(&["t1"]);
    let log: Log = Arc::default();
    broker.add_topic_consumer(acking_consumer("t1", log.clone())).unwrap();

    broker
        .publish("t1", (0..10).map(|i| envelope(json!(i))).collect())
        .unwrap();
    broker.start_consuming().unwrap();

    assert_eq!(payloads(&log), (0..10).map(|i| json!(i)).collect::<Vec<_>>());
    assert_eq!(broker.get_topic_approximate_messages_count("t1").unwrap(), 0);
}

#[test]
fn test_broker_prefetch_two_delivers_all() {
    let broker = broker_with(&["t1"]);
    let log: Log = Arc::default();
    broker
        .add_topic_consumer(acking_consumer("t1", log.clone()).with_prefetch(2))
        .unwrap();

    broker
        .publish("t1", vec![envelope(json!("a")), envelope(json!("b")), envelope(json!("c"))])
        .unwrap();
    broker.start_consuming().unwrap();

    assert_eq!(payloads(&log), vec![json!("a"), json!("b"), json!("c")]);
    assert!(log.lock().unwrap().iter().all(|(_, action)| *action == "ack"));
}

#[test]
fn test_broker_reject_then_ack_redelivers_first() {
    let broker = broker_with(&["t1"]);
    let log: Log = Arc::default();
    let seen = log.clone();
    let rejected_once = Arc::new(Mutex::new(false));

    broker
        .add_topic_consumer(BrokerConsumer::new("t1", "workers", move |env, manager| {
            let mut rejected = rejected_once.lock().unwrap();
            if env.payload == json!("a") && !*rejected {
                *rejected = true;
                manager.reject()?;
                seen.lock().unwrap().push((env.payload, "reject"));
            } else {
                manager.ack()?;
                seen.lock().unwrap().push((env.payload, "ack"));
            }
            Ok(())
        }))
        .unwrap();

    broker
        .publish("t1", vec![envelope(json!("a")), envelope(json!("b"))])
        .unwrap();
    broker.start_consuming().unwrap();

    assert_eq!(
        log.lock().unwrap().clone(),
        vec![(json!("a"), "reject"), (json!("a"), "ack"), (json!("b"), "ack")]
    );
}

#[test]
fn test_broker_message_count_after_ack() {
    let broker = broker_with(&["t1"]);
    broker
        .publish("t1", vec![envelope(json!(1)), envelope(json!(2)), envelope(json!(3))])
        .unwrap();

    let queue = broker.queue("t1").unwrap();
    let (message_id, _) = queue.reserve_next().unwrap();
    queue.mark_as_processed(message_id);

    assert_eq!(broker.get_topic_approximate_messages_count("t1").unwrap(), 2);
}

#[test]
fn test_broker_start_twice_fails_without_redelivery() {
    let broker = broker_with(&["t1"]);
    let log: Log = Arc::default();
    broker.add_topic_consumer(acking_consumer("t1", log.clone())).unwrap();
    broker.publish("t1", vec![envelope(json!(1))]).unwrap();

    broker.start_consuming().unwrap();
    let err = broker.start_consuming().unwrap_err();

    assert!(matches!(err, BrokerError::AlreadyConsuming));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn test_broker_start_without_consumers_is_noop() {
    let broker = broker_with(&["t1"]);
    broker.publish("t1", vec![envelope(json!(1))]).unwrap();

    broker.start_consuming().unwrap();

    assert!(!broker.is_consuming());
    assert_eq!(broker.get_topic_approximate_messages_count("t1").unwrap(), 1);
}

#[test]
fn test_broker_publish_after_start_dispatches_immediately() {
    let broker = broker_with(&["t1"]);
    let log: Log = Arc::default();
    broker.add_topic_consumer(acking_consumer("t1", log.clone())).unwrap();
    broker.start_consuming().unwrap();
    assert!(log.lock().unwrap().is_empty());

    broker.publish("t1", vec![envelope(json!("late"))]).unwrap();

    assert_eq!(payloads(&log), vec![json!("late")]);
}

#[test]
fn test_broker_reentrant_publish_is_picked_up_by_running_loop() {
    let broker = Arc::new(broker_with(&["t1"]));
    let log: Log = Arc::default();
    let seen = log.clone();
    let inner = Arc::downgrade(&broker);

    broker
        .add_topic_consumer(BrokerConsumer::new("t1", "workers", move |env, manager| {
            if env.payload == json!("parent") {
                if let Some(broker) = inner.upgrade() {
                    broker.publish("t1", vec![env.create_child(json!("child"))])?;
                }
            }
            manager.ack()?;
            seen.lock().unwrap().push((env.payload, "ack"));
            Ok(())
        }))
        .unwrap();

    broker.publish("t1", vec![envelope(json!("parent"))]).unwrap();
    broker.start_consuming().unwrap();

    assert_eq!(payloads(&log), vec![json!("parent"), json!("child")]);
    assert!(!broker.queue("t1").unwrap().has_messages_to_process());
}

#[test]
fn test_broker_unknown_topic_errors() {
    let broker = broker_with(&["t1"]);
    let log: Log = Arc::default();

    let err = broker.publish("nope", vec![envelope(json!(1))]).unwrap_err();
    assert!(matches!(err, BrokerError::UnknownTopic(ref t) if t == "nope"));

    let err = broker.add_topic_consumer(acking_consumer("nope", log)).unwrap_err();
    assert!(matches!(err, BrokerError::UnknownTopic(_)));
    assert_eq!(broker.consumers_count(), 0);
}

#[test]
fn test_broker_reinitialize_keeps_pending_messages() {
    let broker = broker_with(&["t1"]);
    broker.publish("t1", vec![envelope(json!(1))]).unwrap();

    broker.initialize(&["t1"], &[]).unwrap();

    assert_eq!(broker.get_topic_approximate_messages_count("t1").unwrap(), 1);
}

#[test]
fn test_broker_handler_error_propagates_and_message_is_kept() {
    let broker = broker_with(&["t1"]);
    broker
        .add_topic_consumer(BrokerConsumer::new("t1", "workers", |_, _| {
            Err(HandlerError::from("boom"))
        }))
        .unwrap();
    broker.publish("t1", vec![envelope(json!(1))]).unwrap();

    let err = broker.start_consuming().unwrap_err();

    assert!(matches!(err, BrokerError::Handler(ref e) if e.to_string() == "boom"));
    assert_eq!(broker.get_topic_approximate_messages_count("t1").unwrap(), 1);
}

#[test]
fn test_broker_unsettled_message_is_an_error() {
    let broker = broker_with(&["t1"]);
    broker
        .add_topic_consumer(BrokerConsumer::new("t1", "workers", |_, _| Ok(())))
        .unwrap();
    broker.publish("t1", vec![envelope(json!(1))]).unwrap();

    let err = broker.start_consuming().unwrap_err();

    assert!(matches!(err, BrokerError::UnsettledMessage { ref topic, .. } if topic == "t1"));
}

#[test]
fn test_broker_drains_topics_in_initialization_order() {
    let broker = broker_with(&["second", "first"]);
    let log: Log = Arc::default();
    broker.add_topic_consumer(acking_consumer("first", log.clone())).unwrap();
    broker.add_topic_consumer(acking_consumer("second", log.clone())).unwrap();
    broker.publish("first", vec![envelope(json!("f"))]).unwrap();
    broker.publish("second", vec![envelope(json!("s"))]).unwrap();

    broker.start_consuming().unwrap();

    assert_eq!(payloads(&log), vec![json!("s"), json!("f")]);
    assert_eq!(broker.consumers_count(), 2);
}

#[test]
fn test_broker_answer_roundtrip() {
    let broker = MemoryBroker::new();
    broker.initialize(&["jobs"], &["jobs.answers"]).unwrap();
    let request = envelope(json!({"job": 1}));
    let answer = request.create_child(json!({"done": true}));

    broker
        .publish_answer("jobs.answers", request.id, answer.clone())
        .unwrap();
    let received = broker
        .get_answer("jobs.answers", request.id, Duration::from_millis(10))
        .unwrap();

    assert_eq!(received, answer);
    assert_eq!(received.parent_id, Some(request.id));
}

#[test]
fn test_broker_answer_from_other_thread() {
    let broker = Arc::new(MemoryBroker::new());
    broker.initialize(&[], &["answers"]).unwrap();
    let correlation_id = Uuid::new_v4();

    let publisher = Arc::clone(&broker);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        publisher
            .publish_answer("answers", correlation_id, envelope(json!("pong")))
            .unwrap();
    });

    let received = broker
        .get_answer("answers", correlation_id, Duration::from_secs(5))
        .unwrap();
    handle.join().unwrap();

    assert_eq!(received.payload, json!("pong"));
}

#[test]
fn test_broker_answer_timeout() {
    let broker = MemoryBroker::new();
    broker.initialize(&[], &["answers"]).unwrap();

    let err = broker
        .get_answer("answers", Uuid::new_v4(), Duration::from_millis(10))
        .unwrap_err();
    assert!(matches!(err, BrokerError::AnswerTimeout { .. }));

    let err = broker
        .publish_answer("unknown", Uuid::new_v4(), envelope(json!(1)))
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnknownTopic(_)));
}

#[test]
fn test_envelope_encoding_is_symmetric() {
    let original = envelope(json!({"nested": [1, 2, 3]}));
    let decoded = MessageEnvelope::decode(&original.encode().unwrap()).unwrap();
    assert_eq!(decoded, original);
    assert!(MessageEnvelope::decode(b"not json").is_err());
}

struct FlakyBroker {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    fatal: bool,
}

impl FlakyBroker {
    fn new(failures: u32, fatal: bool) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            fatal,
        }
    }
}

impl Broker for FlakyBroker {
    fn connect(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(BrokerError::Unsupported("fatal"));
        }
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(BrokerError::Connection("refused".to_string()));
        }
        Ok(())
    }
    fn close(&self) -> Result<()> {
        Ok(())
    }
    fn initialize(&self, _: &[&str], _: &[&str]) -> Result<()> {
        Ok(())
    }
    fn add_topic_consumer(&self, _: BrokerConsumer) -> Result<()> {
        Ok(())
    }
    fn start_consuming(&self) -> Result<()> {
        Ok(())
    }
    fn stop_consuming(&self) {}
    fn publish(&self, _: &str, _: Vec<MessageEnvelope>) -> Result<()> {
        Ok(())
    }
    fn publish_answer(&self, _: &str, _: Uuid, _: MessageEnvelope) -> Result<()> {
        Ok(())
    }
    fn get_answer(&self, topic: &str, correlation_id: Uuid, _: Duration) -> Result<MessageEnvelope> {
        Err(BrokerError::AnswerTimeout {
            topic: topic.to_string(),
            correlation_id,
        })
    }
    fn get_topic_approximate_messages_count(&self, _: &str) -> Result<usize> {
        Ok(0)
    }
}

#[test]
fn test_connect_with_retry_recovers() {
    let broker = FlakyBroker::new(2, false);
    connect_with_retry(&broker, 3, Duration::from_millis(1)).unwrap();
    assert_eq!(broker.attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn test_connect_with_retry_gives_up() {
    let broker = FlakyBroker::new(5, false);
    let err = connect_with_retry(&broker, 3, Duration::from_millis(1)).unwrap_err();
    assert!(err.is_connection());
    assert_eq!(broker.attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn test_connect_with_retry_does_not_retry_other_errors() {
    let broker = FlakyBroker::new(0, true);
    let err = connect_with_retry(&broker, 3, Duration::from_millis(1)).unwrap_err();
    assert!(matches!(err, BrokerError::Unsupported(_)));
    assert_eq!(broker.attempts.load(Ordering::SeqCst), 1);
}
