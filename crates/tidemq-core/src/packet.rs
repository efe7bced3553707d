//! MQTT packet types and codec for MQTT 3.1 and 3.1.1.
//!
//! Every packet kind supports three operations: [`Packet::encoded_len`]
//! reports the exact wire size, [`Packet::encode`] writes into a
//! caller-provided buffer, and [`decode_packet`] parses one packet from
//! the front of a byte buffer. Encoding and decoding are exact inverses
//! of each other for every valid byte string.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// MQTT control packet types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

impl PacketType {
    /// Packet type name as it appears in the MQTT specification.
    pub fn name(&self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::Connack => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::Puback => "PUBACK",
            PacketType::Pubrec => "PUBREC",
            PacketType::Pubrel => "PUBREL",
            PacketType::Pubcomp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::Suback => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::Unsuback => "UNSUBACK",
            PacketType::Pingreq => "PINGREQ",
            PacketType::Pingresp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
        }
    }

    /// Required fixed-header flags for this packet type.
    ///
    /// PUBLISH carries dup/qos/retain in the low nibble instead and is
    /// exempt from this check.
    pub fn default_flags(&self) -> u8 {
        match self {
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => 0x02,
            _ => 0x00,
        }
    }
}

/// Quality of service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {}",
                value
            ))),
        }
    }
}

impl ConnackCode {
    pub fn is_accepted(&self) -> bool {
        *self == ConnackCode::Accepted
    }

    /// Human-readable reason for a refused connection.
    pub fn description(&self) -> &'static str {
        match self {
            ConnackCode::Accepted => "connection accepted",
            ConnackCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnackCode::IdentifierRejected => "identifier rejected",
            ConnackCode::ServerUnavailable => "server unavailable",
            ConnackCode::BadUsernamePassword => "bad user name or password",
            ConnackCode::NotAuthorized => "not authorized",
        }
    }
}

/// An application message as routed by the broker: the payload published
/// on a topic together with its delivery qos and retain flag. Also used
/// for the will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

/// A single subscription: a topic filter plus the granted qos cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Protocol versions understood by the codec.
pub const VERSION_311: u8 = 4;
pub const VERSION_31: u8 = 3;

fn protocol_name(version: u8) -> Option<&'static str> {
    match version {
        VERSION_311 => Some("MQTT"),
        VERSION_31 => Some("MQIsdp"),
        _ => None,
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol level: 4 (MQTT 3.1.1) or 3 (MQTT 3.1).
    pub version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Message>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            version: VERSION_311,
            clean_session: true,
            keep_alive: 0,
            client_id: String::new(),
            will: None,
            username: None,
            password: None,
        }
    }
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff qos > 0.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    /// Build a PUBLISH from an application message.
    pub fn from_message(msg: &Message, packet_id: Option<u16>) -> Self {
        Self {
            dup: false,
            qos: msg.qos,
            retain: msg.retain,
            topic: msg.topic.clone(),
            packet_id,
            payload: msg.payload.clone(),
        }
    }

    /// View this PUBLISH as an application message.
    pub fn to_message(&self) -> Message {
        Message {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
        }
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

/// SUBACK packet data. Return codes are granted qos values (0-2) or
/// 0x80 for failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// SUBACK failure return code.
pub const SUBACK_FAILURE: u8 = 0x80;

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// MQTT packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Number of bytes in the variable header and payload.
    fn remaining_len(&self) -> usize {
        match self {
            Packet::Connect(c) => {
                let name_len = protocol_name(c.version).map_or(4, str::len);
                let mut n = 2 + name_len + 1 + 1 + 2 + 2 + c.client_id.len();
                if let Some(will) = &c.will {
                    n += 2 + will.topic.len() + 2 + will.payload.len();
                }
                if let Some(username) = &c.username {
                    n += 2 + username.len();
                }
                if let Some(password) = &c.password {
                    n += 2 + password.len();
                }
                n
            }
            Packet::Connack(_) => 2,
            Packet::Publish(p) => {
                let id_len = if p.qos != QoS::AtMostOnce { 2 } else { 0 };
                2 + p.topic.len() + id_len + p.payload.len()
            }
            Packet::Puback { .. }
            | Packet::Pubrec { .. }
            | Packet::Pubrel { .. }
            | Packet::Pubcomp { .. }
            | Packet::Unsuback { .. } => 2,
            Packet::Subscribe(s) => {
                2 + s
                    .subscriptions
                    .iter()
                    .map(|sub| 2 + sub.topic.len() + 1)
                    .sum::<usize>()
            }
            Packet::Suback(s) => 2 + s.return_codes.len(),
            Packet::Unsubscribe(u) => {
                2 + u.topics.iter().map(|t| 2 + t.len()).sum::<usize>()
            }
            Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => 0,
        }
    }

    /// Total encoded size in bytes, fixed header included.
    pub fn encoded_len(&self) -> usize {
        let remaining = self.remaining_len();
        1 + varint::encoded_len(remaining) + remaining
    }

    /// Encode the packet into `dst`, returning the number of bytes
    /// written. Fails with `InsufficientBuffer`, before anything is
    /// written, when `dst` is smaller than
    /// [`encoded_len`](Self::encoded_len), and with `FieldTooLong` when
    /// a length-prefixed field exceeds 65535 bytes.
    pub fn encode(&self, dst: &mut [u8]) -> Result<usize> {
        self.validate_encode()?;

        let remaining = self.remaining_len();
        if remaining > varint::MAX_REMAINING_LENGTH {
            return Err(ProtocolError::MalformedPacket(format!(
                "Remaining length {} exceeds maximum",
                remaining
            ))
            .into());
        }

        let total = 1 + varint::encoded_len(remaining) + remaining;
        if dst.len() < total {
            return Err(ProtocolError::InsufficientBuffer {
                needed: total,
                have: dst.len(),
            }
            .into());
        }

        let mut enc = Encoder::new(dst);
        enc.write_u8(self.header_byte());
        enc.write_remaining_length(remaining);

        match self {
            Packet::Connect(c) => encode_connect(c, &mut enc)?,
            Packet::Connack(c) => {
                enc.write_u8(if c.session_present { 1 } else { 0 });
                enc.write_u8(c.code as u8);
            }
            Packet::Publish(p) => encode_publish(p, &mut enc)?,
            Packet::Puback { packet_id }
            | Packet::Pubrec { packet_id }
            | Packet::Pubrel { packet_id }
            | Packet::Pubcomp { packet_id }
            | Packet::Unsuback { packet_id } => enc.write_u16(*packet_id),
            Packet::Subscribe(s) => {
                enc.write_u16(s.packet_id);
                for sub in &s.subscriptions {
                    enc.write_lp_bytes(sub.topic.as_bytes())?;
                    enc.write_u8(sub.qos as u8);
                }
            }
            Packet::Suback(s) => {
                enc.write_u16(s.packet_id);
                enc.write_slice(&s.return_codes);
            }
            Packet::Unsubscribe(u) => {
                enc.write_u16(u.packet_id);
                for topic in &u.topics {
                    enc.write_lp_bytes(topic.as_bytes())?;
                }
            }
            Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => {}
        }

        debug_assert_eq!(enc.pos, total);
        Ok(enc.pos)
    }

    fn header_byte(&self) -> u8 {
        match self {
            Packet::Publish(p) => {
                let mut header = (PacketType::Publish as u8) << 4;
                if p.dup {
                    header |= 0x08;
                }
                header |= (p.qos as u8) << 1;
                if p.retain {
                    header |= 0x01;
                }
                header
            }
            _ => {
                let t = self.packet_type();
                ((t as u8) << 4) | t.default_flags()
            }
        }
    }

    /// Structural checks that do not depend on the destination buffer.
    fn validate_encode(&self) -> Result<()> {
        match self {
            Packet::Connect(c) => {
                if protocol_name(c.version).is_none() {
                    return Err(ProtocolError::InvalidProtocol {
                        name: String::new(),
                        level: c.version,
                    }
                    .into());
                }
                if c.password.is_some() && c.username.is_none() {
                    return Err(ProtocolError::MalformedPacket(
                        "Password set without username".into(),
                    )
                    .into());
                }
                if !c.clean_session && c.client_id.is_empty() {
                    return Err(ProtocolError::IdentifierRejected.into());
                }
                Ok(())
            }
            Packet::Publish(p) => {
                if p.qos != QoS::AtMostOnce && p.packet_id.is_none() {
                    return Err(ProtocolError::MalformedPacket(
                        "Missing packet identifier on qos > 0 publish".into(),
                    )
                    .into());
                }
                Ok(())
            }
            Packet::Subscribe(s) if s.subscriptions.is_empty() => {
                Err(ProtocolError::EmptyPayload.into())
            }
            Packet::Unsubscribe(u) if u.topics.is_empty() => {
                Err(ProtocolError::EmptyPayload.into())
            }
            _ => Ok(()),
        }
    }
}

/// Write cursor over a preallocated buffer.
///
/// Buffer capacity is validated up front by [`Packet::encode`]; the
/// length-prefix cap is the only check left to the write path.
struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn write_u8(&mut self, value: u8) {
        self.buf[self.pos] = value;
        self.pos += 1;
    }

    fn write_u16(&mut self, value: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&value.to_be_bytes());
        self.pos += 2;
    }

    fn write_slice(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn write_lp_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > u16::MAX as usize {
            return Err(ProtocolError::FieldTooLong(bytes.len()).into());
        }
        self.write_u16(bytes.len() as u16);
        self.write_slice(bytes);
        Ok(())
    }

    fn write_remaining_length(&mut self, value: usize) {
        let n = varint::encode_to_slice(value, &mut self.buf[self.pos..]);
        self.pos += n;
    }
}

/// Read cursor over a byte buffer.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::InsufficientBytes { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::InsufficientBytes {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::InsufficientBytes {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_lp_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_lp_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }
}

/// Try to decode a complete packet from the front of the buffer.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` on success, `Ok(None)`
/// if more data is needed, or `Err` on protocol errors.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type = PacketType::try_from(fixed_header >> 4)?;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;
    if buf.len() < total_len {
        return Ok(None);
    }

    // Every type except PUBLISH carries fixed flags in the low nibble.
    if packet_type != PacketType::Publish && flags != packet_type.default_flags() {
        return Err(ProtocolError::InvalidFlags {
            kind: packet_type.name(),
            flags,
        }
        .into());
    }

    let payload = &buf[header_len..total_len];

    let packet = match packet_type {
        PacketType::Connect => decode_connect(payload)?,
        PacketType::Connack => decode_connack(payload)?,
        PacketType::Publish => decode_publish(flags, payload)?,
        PacketType::Puback => Packet::Puback {
            packet_id: decode_packet_id(payload)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decode_packet_id(payload)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decode_packet_id(payload)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decode_packet_id(payload)?,
        },
        PacketType::Subscribe => decode_subscribe(payload)?,
        PacketType::Suback => decode_suback(payload)?,
        PacketType::Unsubscribe => decode_unsubscribe(payload)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: decode_packet_id(payload)?,
        },
        PacketType::Pingreq => decode_empty(payload, Packet::Pingreq)?,
        PacketType::Pingresp => decode_empty(payload, Packet::Pingresp)?,
        PacketType::Disconnect => decode_empty(payload, Packet::Disconnect)?,
    };

    Ok(Some((packet, total_len)))
}

fn decode_empty(payload: &[u8], packet: Packet) -> Result<Packet> {
    if !payload.is_empty() {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} must have zero remaining length",
            packet.packet_type().name()
        ))
        .into());
    }
    Ok(packet)
}

fn decode_packet_id(payload: &[u8]) -> Result<u16> {
    if payload.len() != 2 {
        return Err(ProtocolError::MalformedPacket(
            "Acknowledgement must carry exactly a packet identifier".into(),
        )
        .into());
    }
    let mut dec = Decoder::new(payload);
    dec.read_u16()
}

fn decode_connect(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);

    let name = dec.read_string()?;
    let version = dec.read_u8()?;
    match (name.as_str(), version) {
        ("MQTT", VERSION_311) | ("MQIsdp", VERSION_31) => {}
        _ => {
            return Err(ProtocolError::InvalidProtocol {
                name,
                level: version,
            }
            .into())
        }
    }

    let flags = dec.read_u8()?;

    // Reserved bit must be zero.
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // Will qos and retain must be zero when there is no will.
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    // A password requires a username.
    if password_flag && !username_flag {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    if !clean_session && client_id.is_empty() {
        return Err(ProtocolError::IdentifierRejected.into());
    }

    let will = if will_flag {
        let topic = dec.read_string()?;
        let payload = dec.read_lp_bytes()?;
        Some(Message {
            topic,
            payload: Bytes::copy_from_slice(payload),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_lp_bytes()?.to_vec())
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        version,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn encode_connect(c: &Connect, enc: &mut Encoder) -> Result<()> {
    // Checked by validate_encode.
    let name = protocol_name(c.version).unwrap_or("MQTT");
    enc.write_lp_bytes(name.as_bytes())?;
    enc.write_u8(c.version);

    let mut flags = 0u8;
    if c.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &c.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if c.password.is_some() {
        flags |= 0x40;
    }
    if c.username.is_some() {
        flags |= 0x80;
    }
    enc.write_u8(flags);

    enc.write_u16(c.keep_alive);
    enc.write_lp_bytes(c.client_id.as_bytes())?;

    if let Some(will) = &c.will {
        enc.write_lp_bytes(will.topic.as_bytes())?;
        enc.write_lp_bytes(&will.payload)?;
    }
    if let Some(username) = &c.username {
        enc.write_lp_bytes(username.as_bytes())?;
    }
    if let Some(password) = &c.password {
        enc.write_lp_bytes(password)?;
    }

    Ok(())
}

fn decode_connack(payload: &[u8]) -> Result<Packet> {
    if payload.len() != 2 {
        return Err(
            ProtocolError::MalformedPacket("CONNACK must have remaining length 2".into()).into(),
        );
    }

    let ack_flags = payload[0];
    if (ack_flags & 0xFE) != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "Reserved CONNACK flags set: {:#04x}",
            ack_flags
        ))
        .into());
    }

    Ok(Packet::Connack(Connack {
        session_present: (ack_flags & 0x01) != 0,
        code: ConnackCode::try_from(payload[1])?,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(payload);

    let topic = dec.read_string()?;
    if topic.is_empty() {
        return Err(ProtocolError::MalformedPacket("Empty publish topic".into()).into());
    }
    // Topic names must not contain wildcard characters.
    if topic.contains(['+', '#']) {
        return Err(ProtocolError::WildcardTopic.into());
    }

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_u16()?)
    } else {
        None
    };

    let payload_data = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(payload_data),
    }))
}

fn encode_publish(p: &Publish, enc: &mut Encoder) -> Result<()> {
    enc.write_lp_bytes(p.topic.as_bytes())?;
    if p.qos != QoS::AtMostOnce {
        // Checked by validate_encode.
        if let Some(id) = p.packet_id {
            enc.write_u16(id);
        }
    }
    enc.write_slice(&p.payload);
    Ok(())
}

fn decode_subscribe(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let mut subscriptions = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        let qos = QoS::try_from(dec.read_u8()?)?;
        subscriptions.push(Subscription { topic, qos });
    }

    if subscriptions.is_empty() {
        return Err(ProtocolError::EmptyPayload.into());
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let codes = dec.read_bytes(dec.remaining())?;
    for &code in codes {
        if code > 2 && code != SUBACK_FAILURE {
            return Err(ProtocolError::MalformedPacket(format!(
                "Invalid SUBACK return code: {:#04x}",
                code
            ))
            .into());
        }
    }

    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes: codes.to_vec(),
    }))
}

fn decode_unsubscribe(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        topics.push(dec.read_string()?);
    }

    if topics.is_empty() {
        return Err(ProtocolError::EmptyPayload.into());
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}
