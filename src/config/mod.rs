mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerKind, BrokerSettings, KafkaSettings, LoggingSettings, Settings};

/// Loads the configuration from `config/default` and `UNIBROKER_*` environment
/// variables (nested keys separated by `__`, e.g. `UNIBROKER_KAFKA__RETRIES`).
/// Values that are not provided fall back to `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("UNIBROKER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let broker = partial.broker;
    let kafka = partial.kafka;
    let logging = partial.logging;

    Settings {
        broker: BrokerSettings {
            kind: broker
                .as_ref()
                .and_then(|b| b.kind)
                .unwrap_or(default.broker.kind),
            retry_max_count: broker
                .as_ref()
                .and_then(|b| b.retry_max_count)
                .unwrap_or(default.broker.retry_max_count),
            retry_delay_secs: broker
                .as_ref()
                .and_then(|b| b.retry_delay_secs)
                .unwrap_or(default.broker.retry_delay_secs),
        },
        kafka: KafkaSettings {
            bootstrap_servers: kafka
                .as_ref()
                .and_then(|k| k.bootstrap_servers.clone())
                .unwrap_or(default.kafka.bootstrap_servers),
            api_version: kafka
                .as_ref()
                .and_then(|k| k.api_version.clone())
                .unwrap_or(default.kafka.api_version),
            retries: kafka
                .as_ref()
                .and_then(|k| k.retries)
                .unwrap_or(default.kafka.retries),
            retry_delay_ms: kafka
                .as_ref()
                .and_then(|k| k.retry_delay_ms)
                .unwrap_or(default.kafka.retry_delay_ms),
            poll_timeout_ms: kafka
                .as_ref()
                .and_then(|k| k.poll_timeout_ms)
                .unwrap_or(default.kafka.poll_timeout_ms),
            connect_timeout_ms: kafka
                .as_ref()
                .and_then(|k| k.connect_timeout_ms)
                .unwrap_or(default.kafka.connect_timeout_ms),
        },
        logging: LoggingSettings {
            level: logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    }
}
