//! Error types for tidemq-core.

use thiserror::Error;

/// Main error type shared by the codec and the transport layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport reached end of stream or was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Outbound queue full")]
    QueueFull,
}

/// MQTT protocol errors raised by the packet codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    InsufficientBytes { needed: usize, have: usize },

    #[error("Destination buffer too small: need {needed} bytes, have {have}")]
    InsufficientBuffer { needed: usize, have: usize },

    #[error("Length-prefixed field exceeds 65535 bytes: {0}")]
    FieldTooLong(usize),

    #[error("Unsupported protocol name/level pair: '{name}' level {level}")]
    InvalidProtocol { name: String, level: u8 },

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Empty client identifier with clean session disabled")]
    IdentifierRejected,

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Publish topic contains wildcard characters")]
    WildcardTopic,

    #[error("Packet must carry at least one topic filter")]
    EmptyPayload,

    #[error("Invalid fixed header flags for {kind}: {flags:#04x}")]
    InvalidFlags { kind: &'static str, flags: u8 },

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

pub type Result<T> = std::result::Result<T, Error>;
