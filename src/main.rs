//! CLI for UniBroker
//!
//! Subcommands:
//! - `publish`: publish JSON payloads to a topic
//! - `consume`: print and acknowledge every message of a topic until Ctrl-C

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use unibroker::broker::{self, Broker, BrokerConsumer, MessageEnvelope, connect_with_retry};
use unibroker::config::{Settings, load_config};
use unibroker::utils::logging;

#[derive(Parser)]
#[command(name = "unibroker")]
enum Command {
    /// Publish one message per payload argument
    Publish {
        #[arg(long)]
        topic: String,
        /// JSON payloads; anything that is not valid JSON is sent as a string
        #[arg(required = true)]
        payloads: Vec<String>,
    },
    /// Consume a topic, printing and acknowledging every message
    Consume {
        #[arg(long)]
        topic: String,
        #[arg(long, default_value = "unibroker-cli")]
        group: String,
        #[arg(long, default_value_t = 1)]
        prefetch: usize,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match Command::parse() {
        Command::Publish { topic, payloads } => run_publish(&settings, &topic, payloads),
        Command::Consume {
            topic,
            group,
            prefetch,
        } => run_consume(&settings, topic, group, prefetch).await,
    };

    if let Err(e) = result {
        error!("unibroker failed: {}", e);
        std::process::exit(1);
    }
}

fn connect(settings: &Settings, topic: &str) -> Result<Arc<dyn Broker>, Box<dyn std::error::Error>> {
    let broker: Arc<dyn Broker> = broker::from_settings(settings).into();
    connect_with_retry(
        &*broker,
        settings.broker.retry_max_count,
        Duration::from_secs(settings.broker.retry_delay_secs),
    )?;
    broker.initialize(&[topic], &[])?;
    Ok(broker)
}

fn run_publish(
    settings: &Settings,
    topic: &str,
    payloads: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = connect(settings, topic)?;
    let envelopes: Vec<MessageEnvelope> = payloads
        .into_iter()
        .map(|raw| {
            let payload = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
            MessageEnvelope::new(payload)
        })
        .collect();

    let count = envelopes.len();
    broker.publish(topic, envelopes)?;
    info!(topic, count, "published");
    broker.close()?;
    Ok(())
}

async fn run_consume(
    settings: &Settings,
    topic: String,
    group: String,
    prefetch: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = connect(settings, &topic)?;
    let consumer = BrokerConsumer::new(&topic, &group, |envelope, manager| {
        println!("{} {}", envelope.id, envelope.payload);
        manager.ack()?;
        Ok(())
    })
    .with_prefetch(prefetch);
    broker.add_topic_consumer(consumer)?;

    let consuming = Arc::clone(&broker);
    let mut handle = tokio::task::spawn_blocking(move || consuming.start_consuming());

    let consumed = tokio::select! {
        joined = &mut handle => joined?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Stopping consumer.");
            broker.stop_consuming();
            handle.await?
        }
    };

    broker.close()?;
    consumed?;
    Ok(())
}
