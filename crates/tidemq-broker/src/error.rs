//! Broker error types.

use thiserror::Error;

use tidemq_core::packet::PacketType;

/// Broker error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error(transparent)]
    Core(#[from] tidemq_core::Error),

    #[error("First packet must be CONNECT")]
    ExpectedConnect,

    #[error("Unexpected {0:?} packet from client")]
    UnexpectedPacket(PacketType),

    #[error("Connection refused: {0}")]
    ConnectionRefused(&'static str),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
