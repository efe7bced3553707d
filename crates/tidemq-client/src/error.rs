//! Client error types.

use thiserror::Error;

use tidemq_core::packet::{ConnackCode, PacketType};

/// Client error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] tidemq_core::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Connection refused: {}", .0.description())]
    ConnectionRefused(ConnackCode),

    #[error("Future timed out")]
    Timeout,

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Unexpected {0:?} packet from broker")]
    UnexpectedPacket(PacketType),
}

pub type Result<T> = std::result::Result<T, ClientError>;
