//! Broker configuration.
//!
//! Loaded from a TOML file plus environment variables with a `TIDEMQ__`
//! prefix (double underscore for nesting), e.g. `TIDEMQ__QUEUE_SIZE=256`.

use std::path::Path;

use config::{ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_QUEUE_SIZE: usize = 64;

/// Runtime limits for the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Bound of the per-connection delivery and writer queues. A full
    /// delivery queue drops messages for that subscriber; a full writer
    /// queue exerts backpressure on the connection handler.
    pub queue_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from an optional TOML file with environment
    /// variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("TIDEMQ").separator("__"))
            .build()?
            .try_deserialize()
    }
}
