//! tidemq-client - MQTT 3.1/3.1.1 client engine.
//!
//! The [`Client`] drives the MQTT conversation over any
//! [`Connection`](tidemq_core::transport::Connection): connect,
//! publish at QoS 0/1/2, subscribe, unsubscribe, keep-alive and
//! graceful disconnect, with completion futures keyed by packet
//! identifier and session resume across reconnects.

pub mod client;
pub mod config;
pub mod error;
pub mod future;
pub mod tracker;

pub use client::{Client, ConnectionState, MessageCallback};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use future::{FutureOutcome, FutureStore, OpFuture};
pub use tracker::Tracker;

// Re-export the core types used throughout the public API.
pub use tidemq_core::packet::{Message, QoS, Subscription};
