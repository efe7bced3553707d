//! tidemq-core - Core MQTT 3.1/3.1.1 types and utilities.
//!
//! This crate provides the packet codec, per-client session state and
//! the transport abstraction shared between the broker and client
//! crates, plus a scripted flow harness for protocol tests.

pub mod error;
pub mod flow;
pub mod packet;
pub mod session;
pub mod transport;
pub mod varint;

pub use error::{Error, ProtocolError, Result};
pub use packet::*;
pub use session::{Direction, FlowState, Inflight, Session};
pub use transport::{pipe, Connection, Pipe};
