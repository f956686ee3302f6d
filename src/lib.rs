//! # UniBroker
//!
//! `unibroker` is a uniform publish/consume broker abstraction with
//! at-least-once delivery, manual acknowledgement and multiplexed consumer
//! dispatch over a single logical queue per topic.
//!
//! ## Core Modules
//!
//! - `broker`: the `Broker` contract and its in-memory and Kafka backends.
//! - `config`: loading and merging configuration.
//! - `utils`: shared error type and logging bootstrap.

pub mod broker;
pub mod config;
pub mod utils;

pub use broker::{Broker, BrokerConsumer, KafkaBroker, MemoryBroker, MessageEnvelope, MessageManager};
pub use utils::{BrokerError, Result};
