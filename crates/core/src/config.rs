use chrono::{FixedOffset, NaiveTime};
use serde::Deserialize;

use crate::error::{ChatflowError, ChatflowResult};
use crate::types::hhmm;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CHATFLOW__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub flows: FlowConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,
    /// Credits charged per delivered message.
    #[serde(default = "default_price_per_message")]
    pub price_per_message: u64,
    /// Spacing used for instant (unpaced) broadcasts.
    #[serde(default = "default_instant_delay_secs")]
    pub instant_delay_secs: u64,
    /// Offset of the tenants' local clock, used for HH:mm windows and
    /// pacing dates.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// How long a receipt for an unknown message id is kept waiting for
    /// its record before the drain drops it.
    #[serde(default = "default_parked_receipt_ttl_secs")]
    pub parked_receipt_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_nurturing_window_start")]
    pub nurturing_window_start: String,
    #[serde(default = "default_nurturing_window_end")]
    pub nurturing_window_end: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_drain_interval_secs() -> u64 {
    5
}
fn default_drain_batch_size() -> usize {
    500
}
fn default_price_per_message() -> u64 {
    1
}
fn default_instant_delay_secs() -> u64 {
    5
}
fn default_parked_receipt_ttl_secs() -> u64 {
    600
}
fn default_nurturing_window_start() -> String {
    "00:01".to_string()
}
fn default_nurturing_window_end() -> String {
    "23:59".to_string()
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: default_drain_interval_secs(),
            drain_batch_size: default_drain_batch_size(),
            price_per_message: default_price_per_message(),
            instant_delay_secs: default_instant_delay_secs(),
            utc_offset_minutes: 0,
            parked_receipt_ttl_secs: default_parked_receipt_ttl_secs(),
        }
    }
}

impl DeliveryConfig {
    pub fn utc_offset(&self) -> ChatflowResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            ChatflowError::Config(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            ))
        })
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            nurturing_window_start: default_nurturing_window_start(),
            nurturing_window_end: default_nurturing_window_end(),
        }
    }
}

impl FlowConfig {
    /// Parsed `(start, end)` of the nurturing pacing window.
    pub fn nurturing_window(&self) -> ChatflowResult<(NaiveTime, NaiveTime)> {
        let parse = |raw: &str| {
            hhmm::parse(raw)
                .map_err(|e| ChatflowError::Config(format!("invalid HH:mm '{}': {}", raw, e)))
        };
        Ok((
            parse(&self.nurturing_window_start)?,
            parse(&self.nurturing_window_end)?,
        ))
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            delivery: DeliveryConfig::default(),
            flows: FlowConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CHATFLOW")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
