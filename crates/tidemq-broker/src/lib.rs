//! tidemq-broker - Broker-side MQTT state and dispatch.
//!
//! The pieces compose bottom-up: the topic [`tree`] answers wildcard
//! queries, the [`retained`] store keeps the last retained message per
//! topic, the [`backend`] owns sessions and routes publishes, and the
//! [`dispatcher`] speaks MQTT over one connection against a backend.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod retained;
pub mod tree;

pub use backend::{Backend, ClientHandle, MemoryBackend};
pub use config::BrokerConfig;
pub use dispatcher::Dispatcher;
pub use error::{BrokerError, Result};
pub use retained::RetainedStore;
pub use tree::{filter_is_valid, topic_matches_filter, TopicTree};
