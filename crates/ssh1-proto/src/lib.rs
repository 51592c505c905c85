//! SSH protocol 1.5 messages used by the channel multiplexer.
//!
//! A message is a one-byte type tag followed by its payload. Framing, padding, CRC,
//! encryption and compression belong to the transport and are not handled here.
//!
//! Strings are encoded as a big-endian `u32` length followed by the raw bytes.
//! Channel-addressed messages always start with the big-endian recipient channel ID.

use core::fmt;

use bytes::{Buf as _, BufMut as _};

// We re-export these types, because they are used in the public API.
#[rustfmt::skip]
pub use bytes::{Bytes, BytesMut};

/// Identifier assigned to a channel by the remote peer
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct RemoteChannelId(u32);

impl From<u32> for RemoteChannelId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<RemoteChannelId> for u32 {
    fn from(id: RemoteChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for RemoteChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r#{}", self.0)
    }
}

/// Local identifier for a channel (index in the channel table)
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct LocalChannelId(u32);

impl From<u32> for LocalChannelId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<LocalChannelId> for u32 {
    fn from(id: LocalChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for LocalChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l#{}", self.0)
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    NotEnoughBytes {
        name: &'static str,
        received: usize,
        expected: usize,
    },
    InvalidPacket {
        name: &'static str,
        field: &'static str,
        reason: &'static str,
    },
    UnsupportedMessageType {
        tag: u8,
    },
    TrailingBytes {
        name: &'static str,
        count: usize,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotEnoughBytes {
                name,
                received,
                expected,
            } => write!(
                f,
                "not enough bytes provided to decode {name}: received {received} bytes, expected {expected} bytes"
            ),
            Error::InvalidPacket { name, field, reason } => {
                write!(f, "invalid `{field}` in {name}: {reason}")
            }
            Error::UnsupportedMessageType { tag } => write!(f, "unsupported message type {tag}"),
            Error::TrailingBytes { name, count } => write!(f, "{count} unexpected trailing bytes after {name}"),
        }
    }
}

macro_rules! ensure_size {
    ($buf:ident [$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if !(received >= expected) {
            return Err(Error::NotEnoughBytes {
                name: $name,
                received,
                expected,
            });
        }
    }};
}

fn ensure_consumed(buf: &Bytes, name: &'static str) -> Result<(), Error> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(Error::TrailingBytes { name, count: buf.len() })
    }
}

fn get_u32(buf: &mut Bytes, name: &'static str) -> Result<u32, Error> {
    ensure_size!(buf[4] for name);
    Ok(buf.get_u32())
}

fn get_string(buf: &mut Bytes, name: &'static str) -> Result<Bytes, Error> {
    let len = get_u32(buf, name)? as usize;
    ensure_size!(buf[len] for name);
    Ok(buf.split_to(len))
}

fn get_utf8(buf: &mut Bytes, name: &'static str, field: &'static str) -> Result<String, Error> {
    let raw = get_string(buf, name)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidPacket {
        name,
        field,
        reason: "not valid UTF-8",
    })
}

fn get_port(buf: &mut Bytes, name: &'static str) -> Result<u16, Error> {
    let port = get_u32(buf, name)?;
    u16::try_from(port).map_err(|_| Error::InvalidPacket {
        name,
        field: "port",
        reason: "out of range",
    })
}

fn put_string(buf: &mut BytesMut, value: &[u8]) {
    let len = u32::try_from(value.len()).expect("string length never exceeds the maximum packet size");
    buf.put_u32(len);
    buf.put_slice(value);
}

fn string_size(value: &[u8]) -> usize {
    4 + value.len()
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Disconnect = 1,
    Success = 14,
    Failure = 15,
    StdinData = 16,
    StdoutData = 17,
    StderrData = 18,
    Eof = 19,
    ExitStatus = 20,
    OpenConfirmation = 21,
    OpenFailure = 22,
    Data = 23,
    InputEof = 24,
    OutputClosed = 25,
    X11Open = 27,
    PortForwardRequest = 28,
    PortOpen = 29,
    Ignore = 32,
    ExitConfirmation = 33,
    Debug = 36,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(v: u8) -> Result<MessageType, Error> {
        match v {
            1 => Ok(MessageType::Disconnect),
            14 => Ok(MessageType::Success),
            15 => Ok(MessageType::Failure),
            16 => Ok(MessageType::StdinData),
            17 => Ok(MessageType::StdoutData),
            18 => Ok(MessageType::StderrData),
            19 => Ok(MessageType::Eof),
            20 => Ok(MessageType::ExitStatus),
            21 => Ok(MessageType::OpenConfirmation),
            22 => Ok(MessageType::OpenFailure),
            23 => Ok(MessageType::Data),
            24 => Ok(MessageType::InputEof),
            25 => Ok(MessageType::OutputClosed),
            27 => Ok(MessageType::X11Open),
            28 => Ok(MessageType::PortForwardRequest),
            29 => Ok(MessageType::PortOpen),
            32 => Ok(MessageType::Ignore),
            33 => Ok(MessageType::ExitConfirmation),
            36 => Ok(MessageType::Debug),
            tag => Err(Error::UnsupportedMessageType { tag }),
        }
    }
}

impl MessageType {
    /// Whether the payload of this message starts with a recipient channel ID.
    pub fn is_channel_addressed(self) -> bool {
        matches!(
            self,
            MessageType::OpenConfirmation
                | MessageType::OpenFailure
                | MessageType::Data
                | MessageType::InputEof
                | MessageType::OutputClosed
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Disconnect => "MSG_DISCONNECT",
            MessageType::Success => "SMSG_SUCCESS",
            MessageType::Failure => "SMSG_FAILURE",
            MessageType::StdinData => "CMSG_STDIN_DATA",
            MessageType::StdoutData => "SMSG_STDOUT_DATA",
            MessageType::StderrData => "SMSG_STDERR_DATA",
            MessageType::Eof => "CMSG_EOF",
            MessageType::ExitStatus => "SMSG_EXITSTATUS",
            MessageType::OpenConfirmation => "MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::OpenFailure => "MSG_CHANNEL_OPEN_FAILURE",
            MessageType::Data => "MSG_CHANNEL_DATA",
            MessageType::InputEof => "MSG_CHANNEL_INPUT_EOF",
            MessageType::OutputClosed => "MSG_CHANNEL_OUTPUT_CLOSED",
            MessageType::X11Open => "SMSG_X11_OPEN",
            MessageType::PortForwardRequest => "CMSG_PORT_FORWARD_REQUEST",
            MessageType::PortOpen => "MSG_PORT_OPEN",
            MessageType::Ignore => "MSG_IGNORE",
            MessageType::ExitConfirmation => "CMSG_EXIT_CONFIRMATION",
            MessageType::Debug => "MSG_DEBUG",
        };
        write!(f, "{name} ({})", *self as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Disconnect(Disconnect),
    Success,
    Failure,
    StdinData(Bytes),
    StdoutData(Bytes),
    StderrData(Bytes),
    Eof,
    ExitStatus(u32),
    OpenConfirmation(ChannelOpenConfirmation),
    OpenFailure(ChannelOpenFailure),
    Data(ChannelData),
    InputEof(ChannelInputEof),
    OutputClosed(ChannelOutputClosed),
    X11Open(X11Open),
    PortForwardRequest(PortForwardRequest),
    PortOpen(PortOpen),
    Ignore(Bytes),
    ExitConfirmation,
    Debug(String),
}

impl Message {
    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self::Disconnect(Disconnect { reason: reason.into() })
    }

    pub fn open_confirmation(remote_id: RemoteChannelId, local_id: LocalChannelId) -> Self {
        Self::OpenConfirmation(ChannelOpenConfirmation::new(remote_id, local_id))
    }

    pub fn open_failure(remote_id: RemoteChannelId) -> Self {
        Self::OpenFailure(ChannelOpenFailure::new(remote_id))
    }

    pub fn data(remote_id: RemoteChannelId, data: Bytes) -> Self {
        Self::Data(ChannelData::new(remote_id, data))
    }

    pub fn input_eof(remote_id: RemoteChannelId) -> Self {
        Self::InputEof(ChannelInputEof::new(remote_id))
    }

    pub fn output_closed(remote_id: RemoteChannelId) -> Self {
        Self::OutputClosed(ChannelOutputClosed::new(remote_id))
    }

    pub fn port_open(local_id: LocalChannelId, host: impl Into<String>, port: u16, originator: Option<String>) -> Self {
        Self::PortOpen(PortOpen {
            sender_channel_id: u32::from(local_id),
            host: host.into(),
            port,
            originator,
        })
    }

    pub fn x11_open(local_id: LocalChannelId, originator: Option<String>) -> Self {
        Self::X11Open(X11Open {
            sender_channel_id: u32::from(local_id),
            originator,
        })
    }

    pub fn port_forward_request(server_port: u16, host: impl Into<String>, port: u16) -> Self {
        Self::PortForwardRequest(PortForwardRequest {
            server_port,
            host: host.into(),
            port,
        })
    }

    pub fn ty(&self) -> MessageType {
        match self {
            Message::Disconnect(_) => MessageType::Disconnect,
            Message::Success => MessageType::Success,
            Message::Failure => MessageType::Failure,
            Message::StdinData(_) => MessageType::StdinData,
            Message::StdoutData(_) => MessageType::StdoutData,
            Message::StderrData(_) => MessageType::StderrData,
            Message::Eof => MessageType::Eof,
            Message::ExitStatus(_) => MessageType::ExitStatus,
            Message::OpenConfirmation(_) => MessageType::OpenConfirmation,
            Message::OpenFailure(_) => MessageType::OpenFailure,
            Message::Data(_) => MessageType::Data,
            Message::InputEof(_) => MessageType::InputEof,
            Message::OutputClosed(_) => MessageType::OutputClosed,
            Message::X11Open(_) => MessageType::X11Open,
            Message::PortForwardRequest(_) => MessageType::PortForwardRequest,
            Message::PortOpen(_) => MessageType::PortOpen,
            Message::Ignore(_) => MessageType::Ignore,
            Message::ExitConfirmation => MessageType::ExitConfirmation,
            Message::Debug(_) => MessageType::Debug,
        }
    }

    /// Recipient channel ID for channel-addressed messages.
    pub fn recipient_channel_id(&self) -> Option<u32> {
        match self {
            Message::OpenConfirmation(msg) => Some(msg.recipient_channel_id),
            Message::OpenFailure(msg) => Some(msg.recipient_channel_id),
            Message::Data(msg) => Some(msg.recipient_channel_id),
            Message::InputEof(msg) => Some(msg.recipient_channel_id),
            Message::OutputClosed(msg) => Some(msg.recipient_channel_id),
            _ => None,
        }
    }

    /// Size of the encoded message, type tag included.
    pub fn size(&self) -> usize {
        1 + self.payload_size()
    }

    fn payload_size(&self) -> usize {
        match self {
            Message::Disconnect(msg) => string_size(msg.reason.as_bytes()),
            Message::Success | Message::Failure | Message::Eof | Message::ExitConfirmation => 0,
            Message::StdinData(data) | Message::StdoutData(data) | Message::StderrData(data) | Message::Ignore(data) => {
                string_size(data)
            }
            Message::ExitStatus(_) => 4,
            Message::OpenConfirmation(_) => ChannelOpenConfirmation::SIZE,
            Message::OpenFailure(_) => ChannelOpenFailure::SIZE,
            Message::Data(msg) => msg.size(),
            Message::InputEof(_) => ChannelInputEof::SIZE,
            Message::OutputClosed(_) => ChannelOutputClosed::SIZE,
            Message::X11Open(msg) => msg.size(),
            Message::PortForwardRequest(msg) => msg.size(),
            Message::PortOpen(msg) => msg.size(),
            Message::Debug(msg) => string_size(msg.as_bytes()),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());
        buf.put_u8(self.ty() as u8);

        match self {
            Message::Disconnect(msg) => put_string(buf, msg.reason.as_bytes()),
            Message::Success | Message::Failure | Message::Eof | Message::ExitConfirmation => {}
            Message::StdinData(data) | Message::StdoutData(data) | Message::StderrData(data) | Message::Ignore(data) => {
                put_string(buf, data)
            }
            Message::ExitStatus(status) => buf.put_u32(*status),
            Message::OpenConfirmation(msg) => msg.encode(buf),
            Message::OpenFailure(msg) => buf.put_u32(msg.recipient_channel_id),
            Message::Data(msg) => msg.encode(buf),
            Message::InputEof(msg) => buf.put_u32(msg.recipient_channel_id),
            Message::OutputClosed(msg) => buf.put_u32(msg.recipient_channel_id),
            Message::X11Open(msg) => msg.encode(buf),
            Message::PortForwardRequest(msg) => msg.encode(buf),
            Message::PortOpen(msg) => msg.encode(buf),
            Message::Debug(msg) => put_string(buf, msg.as_bytes()),
        }
    }

    /// Decodes a message from its type tag and payload.
    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[1] for "MESSAGE");
        let ty = MessageType::try_from(buf.get_u8())?;
        Self::decode_payload(ty, buf)
    }

    pub fn decode_payload(ty: MessageType, mut buf: Bytes) -> Result<Self, Error> {
        let message = match ty {
            MessageType::Disconnect => Self::Disconnect(Disconnect {
                reason: get_utf8(&mut buf, Disconnect::NAME, "reason")?,
            }),
            MessageType::Success => Self::Success,
            MessageType::Failure => Self::Failure,
            MessageType::StdinData => Self::StdinData(get_string(&mut buf, "CMSG_STDIN_DATA")?),
            MessageType::StdoutData => Self::StdoutData(get_string(&mut buf, "SMSG_STDOUT_DATA")?),
            MessageType::StderrData => Self::StderrData(get_string(&mut buf, "SMSG_STDERR_DATA")?),
            MessageType::Eof => Self::Eof,
            MessageType::ExitStatus => Self::ExitStatus(get_u32(&mut buf, "SMSG_EXITSTATUS")?),
            MessageType::OpenConfirmation => Self::OpenConfirmation(ChannelOpenConfirmation::decode(&mut buf)?),
            MessageType::OpenFailure => Self::OpenFailure(ChannelOpenFailure {
                recipient_channel_id: get_u32(&mut buf, ChannelOpenFailure::NAME)?,
            }),
            MessageType::Data => Self::Data(ChannelData::decode(&mut buf)?),
            MessageType::InputEof => Self::InputEof(ChannelInputEof {
                recipient_channel_id: get_u32(&mut buf, ChannelInputEof::NAME)?,
            }),
            MessageType::OutputClosed => Self::OutputClosed(ChannelOutputClosed {
                recipient_channel_id: get_u32(&mut buf, ChannelOutputClosed::NAME)?,
            }),
            MessageType::X11Open => Self::X11Open(X11Open::decode(&mut buf)?),
            MessageType::PortForwardRequest => Self::PortForwardRequest(PortForwardRequest::decode(&mut buf)?),
            MessageType::PortOpen => Self::PortOpen(PortOpen::decode(&mut buf)?),
            MessageType::Ignore => Self::Ignore(get_string(&mut buf, "MSG_IGNORE")?),
            MessageType::ExitConfirmation => Self::ExitConfirmation,
            MessageType::Debug => Self::Debug(get_utf8(&mut buf, "MSG_DEBUG", "message")?),
        };

        ensure_consumed(&buf, "MESSAGE")?;

        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: String,
}

impl Disconnect {
    pub const NAME: &'static str = "MSG_DISCONNECT";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    pub recipient_channel_id: u32,
    pub sender_channel_id: u32,
}

impl ChannelOpenConfirmation {
    pub const NAME: &'static str = "MSG_CHANNEL_OPEN_CONFIRMATION";
    pub const SIZE: usize = 4 /*recipientChannelId*/ + 4 /*senderChannelId*/;

    pub fn new(remote_id: RemoteChannelId, local_id: LocalChannelId) -> Self {
        Self {
            recipient_channel_id: u32::from(remote_id),
            sender_channel_id: u32::from(local_id),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel_id);
        buf.put_u32(self.sender_channel_id);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        ensure_size!(buf[Self::SIZE] for Self::NAME);
        Ok(Self {
            recipient_channel_id: buf.get_u32(),
            sender_channel_id: buf.get_u32(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    pub recipient_channel_id: u32,
}

impl ChannelOpenFailure {
    pub const NAME: &'static str = "MSG_CHANNEL_OPEN_FAILURE";
    pub const SIZE: usize = 4 /*recipientChannelId*/;

    pub fn new(remote_id: RemoteChannelId) -> Self {
        Self {
            recipient_channel_id: u32::from(remote_id),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub recipient_channel_id: u32,
    pub data: Bytes,
}

// We don't want to print `data` content (usually too big)
impl fmt::Debug for ChannelData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelData")
            .field("recipient_channel_id", &self.recipient_channel_id)
            .field("data.len()", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl ChannelData {
    pub const NAME: &'static str = "MSG_CHANNEL_DATA";
    pub const FIXED_PART_SIZE: usize = 4 /*recipientChannelId*/ + 4 /*dataLength*/;

    pub fn new(remote_id: RemoteChannelId, data: Bytes) -> Self {
        ChannelData {
            recipient_channel_id: u32::from(remote_id),
            data,
        }
    }

    pub fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.data.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel_id);
        put_string(buf, &self.data);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        ensure_size!(buf[Self::FIXED_PART_SIZE] for Self::NAME);
        let recipient_channel_id = buf.get_u32();
        let data = get_string(buf, Self::NAME)?;
        Ok(Self {
            recipient_channel_id,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInputEof {
    pub recipient_channel_id: u32,
}

impl ChannelInputEof {
    pub const NAME: &'static str = "MSG_CHANNEL_INPUT_EOF";
    pub const SIZE: usize = 4 /*recipientChannelId*/;

    pub fn new(remote_id: RemoteChannelId) -> Self {
        Self {
            recipient_channel_id: u32::from(remote_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOutputClosed {
    pub recipient_channel_id: u32,
}

impl ChannelOutputClosed {
    pub const NAME: &'static str = "MSG_CHANNEL_OUTPUT_CLOSED";
    pub const SIZE: usize = 4 /*recipientChannelId*/;

    pub fn new(remote_id: RemoteChannelId) -> Self {
        Self {
            recipient_channel_id: u32::from(remote_id),
        }
    }
}

/// Originator strings are optional in SSH 1.5 and only sent when the peer advertised
/// the `SSH_PROTOFLAG_HOST_IN_FWD_OPEN` flag, hence the trailing `Option`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Open {
    pub sender_channel_id: u32,
    pub originator: Option<String>,
}

impl X11Open {
    pub const NAME: &'static str = "SMSG_X11_OPEN";

    pub fn size(&self) -> usize {
        4 + self.originator.as_ref().map_or(0, |o| string_size(o.as_bytes()))
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sender_channel_id);
        if let Some(originator) = &self.originator {
            put_string(buf, originator.as_bytes());
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let sender_channel_id = get_u32(buf, Self::NAME)?;
        let originator = if buf.is_empty() {
            None
        } else {
            Some(get_utf8(buf, Self::NAME, "originator")?)
        };
        Ok(Self {
            sender_channel_id,
            originator,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardRequest {
    pub server_port: u16,
    pub host: String,
    pub port: u16,
}

impl PortForwardRequest {
    pub const NAME: &'static str = "CMSG_PORT_FORWARD_REQUEST";

    pub fn size(&self) -> usize {
        4 + string_size(self.host.as_bytes()) + 4
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(u32::from(self.server_port));
        put_string(buf, self.host.as_bytes());
        buf.put_u32(u32::from(self.port));
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            server_port: get_port(buf, Self::NAME)?,
            host: get_utf8(buf, Self::NAME, "host")?,
            port: get_port(buf, Self::NAME)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOpen {
    pub sender_channel_id: u32,
    pub host: String,
    pub port: u16,
    pub originator: Option<String>,
}

impl PortOpen {
    pub const NAME: &'static str = "MSG_PORT_OPEN";

    pub fn size(&self) -> usize {
        4 + string_size(self.host.as_bytes()) + 4 + self.originator.as_ref().map_or(0, |o| string_size(o.as_bytes()))
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sender_channel_id);
        put_string(buf, self.host.as_bytes());
        buf.put_u32(u32::from(self.port));
        if let Some(originator) = &self.originator {
            put_string(buf, originator.as_bytes());
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let sender_channel_id = get_u32(buf, Self::NAME)?;
        let host = get_utf8(buf, Self::NAME, "host")?;
        let port = get_port(buf, Self::NAME)?;
        let originator = if buf.is_empty() {
            None
        } else {
            Some(get_utf8(buf, Self::NAME, "originator")?)
        };
        Ok(Self {
            sender_channel_id,
            host,
            port,
            originator,
        })
    }
}
