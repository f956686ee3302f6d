use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the broker selection, the Kafka backend and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub kafka: KafkaSettings,
    pub logging: LoggingSettings,
}

/// Which backend `broker::from_settings` builds.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Memory,
    Kafka,
}

/// Configuration settings for the broker.
///
/// `retry_max_count` and `retry_delay_secs` drive `connect_with_retry`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
    pub retry_max_count: u32,
    pub retry_delay_secs: u64,
}

/// Configuration settings for the Kafka backend.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    /// Broker API version used when version negotiation is unavailable.
    pub api_version: String,
    /// Producer-side retry budget.
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub poll_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub kafka: Option<PartialKafkaSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub kind: Option<BrokerKind>,
    pub retry_max_count: Option<u32>,
    pub retry_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialKafkaSettings {
    pub bootstrap_servers: Option<String>,
    pub api_version: Option<String>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub poll_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            retry_max_count: 3,
            retry_delay_secs: 10,
        }
    }
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            api_version: "2.8.0".to_string(),
            retries: 100,
            retry_delay_ms: 3000,
            poll_timeout_ms: 1000,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            kafka: KafkaSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
