//! Datagram messages exchanged between peers and the relay.
//!
//! Every message travels as one msgpack map with three keys: `t` (type tag),
//! `p` (payload map) and `d` (timestamp, float seconds since the UNIX epoch).
//! Payload keys are kept short on purpose since they are repeated in every
//! datagram; the Rust-side field names are the descriptive ones.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rmpv::Value;
use thiserror::Error;

use crate::peer::{PortType, Role};
use crate::schema::Fields;

/// Free-form values carried by telemetry, control and command messages.
pub type Values = BTreeMap<String, Value>;

const KEY_TYPE: &str = "t";
const KEY_PAYLOAD: &str = "p";
const KEY_TIMESTAMP: &str = "d";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Format(String),
    #[error("{ty}: missing required field `{field}`")]
    MissingField { ty: &'static str, field: &'static str },
    #[error("{ty}: unexpected field `{field}`")]
    UnexpectedField { ty: &'static str, field: String },
    #[error("{ty}: field `{field}` has the wrong type")]
    InvalidField { ty: &'static str, field: &'static str },
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl DecodeError {
    /// The envelope itself could not be read.
    pub fn is_format_error(&self) -> bool {
        matches!(self, DecodeError::Format(_))
    }

    /// The payload does not match the schema of its variant.
    pub fn is_type_error(&self) -> bool {
        matches!(
            self,
            DecodeError::MissingField { .. }
                | DecodeError::UnexpectedField { .. }
                | DecodeError::InvalidField { .. }
        )
    }
}

#[derive(Debug, Error)]
#[error("failed to encode {ty}: {reason}")]
pub struct EncodeError {
    ty: &'static str,
    reason: String,
}

/// The registry of known message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Syn,
    SynAck,
    Ack,
    Heartbeat,
    Latency,
    PeerAnnouncement,
    PeerInfo,
    Telemetry,
    Control,
    Command,
    CommandAck,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::Syn,
        MessageType::SynAck,
        MessageType::Ack,
        MessageType::Heartbeat,
        MessageType::Latency,
        MessageType::PeerAnnouncement,
        MessageType::PeerInfo,
        MessageType::Telemetry,
        MessageType::Control,
        MessageType::Command,
        MessageType::CommandAck,
        MessageType::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Syn => "Syn",
            MessageType::SynAck => "SynAck",
            MessageType::Ack => "Ack",
            MessageType::Heartbeat => "Heartbeat",
            MessageType::Latency => "Latency",
            MessageType::PeerAnnouncement => "PeerAnnouncement",
            MessageType::PeerInfo => "PeerInfo",
            MessageType::Telemetry => "Telemetry",
            MessageType::Control => "Control",
            MessageType::Command => "Command",
            MessageType::CommandAck => "CommandAck",
            MessageType::Error => "Error",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.as_str() == tag)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Syn,
    SynAck,
    Ack,
    Heartbeat,
    Latency,
    /// Peer -> relay: "this socket belongs to `role`/`port_type` of `session_id`".
    ///
    /// Role and port type stay strings on the wire; the relay decides which
    /// values it accepts.
    PeerAnnouncement {
        role: String,
        session_id: String,
        port_type: String,
    },
    /// Relay -> peer: where to send video and control traffic.
    PeerInfo {
        ip: String,
        video_port: u16,
        control_port: u16,
    },
    Telemetry {
        values: Values,
    },
    Control {
        values: Values,
    },
    Command {
        command: String,
        parameters: Values,
        command_id: String,
    },
    CommandAck {
        command_id: String,
    },
    Error {
        error: String,
    },
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::Syn => MessageType::Syn,
            Body::SynAck => MessageType::SynAck,
            Body::Ack => MessageType::Ack,
            Body::Heartbeat => MessageType::Heartbeat,
            Body::Latency => MessageType::Latency,
            Body::PeerAnnouncement { .. } => MessageType::PeerAnnouncement,
            Body::PeerInfo { .. } => MessageType::PeerInfo,
            Body::Telemetry { .. } => MessageType::Telemetry,
            Body::Control { .. } => MessageType::Control,
            Body::Command { .. } => MessageType::Command,
            Body::CommandAck { .. } => MessageType::CommandAck,
            Body::Error { .. } => MessageType::Error,
        }
    }

    fn payload(&self) -> Vec<(Value, Value)> {
        match self {
            Body::Syn | Body::SynAck | Body::Ack | Body::Heartbeat | Body::Latency => Vec::new(),
            Body::PeerAnnouncement {
                role,
                session_id,
                port_type,
            } => vec![
                entry("r", role.as_str()),
                entry("i", session_id.as_str()),
                entry("p", port_type.as_str()),
            ],
            Body::PeerInfo {
                ip,
                video_port,
                control_port,
            } => vec![
                entry("ip", ip.as_str()),
                entry("video_port", *video_port),
                entry("control_port", *control_port),
            ],
            Body::Telemetry { values } | Body::Control { values } => {
                vec![entry("v", values_to_value(values))]
            }
            Body::Command {
                command,
                parameters,
                command_id,
            } => vec![
                entry("c", command.as_str()),
                entry("p", values_to_value(parameters)),
                entry("i", command_id.as_str()),
            ],
            Body::CommandAck { command_id } => vec![entry("i", command_id.as_str())],
            Body::Error { error } => vec![entry("e", error.as_str())],
        }
    }

    fn from_payload(ty: MessageType, payload: &[(Value, Value)]) -> Result<Self, DecodeError> {
        let mut fields = Fields::new(ty.as_str(), payload);
        let body = match ty {
            MessageType::Syn => Body::Syn,
            MessageType::SynAck => Body::SynAck,
            MessageType::Ack => Body::Ack,
            MessageType::Heartbeat => Body::Heartbeat,
            MessageType::Latency => Body::Latency,
            MessageType::PeerAnnouncement => Body::PeerAnnouncement {
                role: fields.required_str("r")?,
                session_id: fields.required_str("i")?,
                port_type: fields.required_str("p")?,
            },
            MessageType::PeerInfo => Body::PeerInfo {
                ip: fields.required_str("ip")?,
                video_port: fields.required_port("video_port")?,
                control_port: fields.required_port("control_port")?,
            },
            MessageType::Telemetry => Body::Telemetry {
                values: fields.optional_values("v")?,
            },
            MessageType::Control => Body::Control {
                values: fields.optional_values("v")?,
            },
            MessageType::Command => Body::Command {
                command: fields.required_str("c")?,
                parameters: fields.optional_values("p")?,
                command_id: match fields.optional_str("i")? {
                    Some(id) => id,
                    None => next_command_id(),
                },
            },
            MessageType::CommandAck => Body::CommandAck {
                command_id: fields.required_str("i")?,
            },
            MessageType::Error => Body::Error {
                error: fields.required_str("e")?,
            },
        };
        fields.finish()?;
        Ok(body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub body: Body,
    pub timestamp: f64,
}

impl Message {
    /// Wraps `body`, stamped with the current wall-clock time.
    pub fn new(body: Body) -> Self {
        Self::with_timestamp(body, unix_now())
    }

    pub fn with_timestamp(body: Body, timestamp: f64) -> Self {
        Self { body, timestamp }
    }

    pub fn announcement(role: Role, session_id: impl Into<String>, port_type: PortType) -> Self {
        Self::new(Body::PeerAnnouncement {
            role: role.as_str().to_owned(),
            session_id: session_id.into(),
            port_type: port_type.as_str().to_owned(),
        })
    }

    pub fn peer_info(ip: impl Into<String>, video_port: u16, control_port: u16) -> Self {
        Self::new(Body::PeerInfo {
            ip: ip.into(),
            video_port,
            control_port,
        })
    }

    /// A command with a freshly generated, process-unique id.
    pub fn command(command: impl Into<String>, parameters: Values) -> Self {
        Self::new(Body::Command {
            command: command.into(),
            parameters,
            command_id: next_command_id(),
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::new(Body::Error {
            error: error.into(),
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        decode(data)
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let envelope = Value::Map(vec![
        entry(KEY_TYPE, message.message_type().as_str()),
        entry(KEY_PAYLOAD, Value::Map(message.body.payload())),
        entry(KEY_TIMESTAMP, message.timestamp),
    ]);

    let mut out = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut out, &envelope).map_err(|e| EncodeError {
        ty: message.message_type().as_str(),
        reason: e.to_string(),
    })?;
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<Message, DecodeError> {
    let envelope = read_envelope(data)?;
    let entries = envelope_entries(&envelope)?;

    let tag = read_tag(entries)?;
    let payload = lookup(entries, KEY_PAYLOAD)
        .ok_or_else(|| DecodeError::Format("missing payload".to_string()))?
        .as_map()
        .ok_or_else(|| DecodeError::Format("payload is not a map".to_string()))?;
    let timestamp = lookup(entries, KEY_TIMESTAMP)
        .ok_or_else(|| DecodeError::Format("missing timestamp".to_string()))?
        .as_f64()
        .ok_or_else(|| DecodeError::Format("timestamp is not a number".to_string()))?;

    let ty = MessageType::from_tag(tag).ok_or_else(|| DecodeError::UnknownType(tag.to_owned()))?;
    let body = Body::from_payload(ty, payload)?;
    Ok(Message { body, timestamp })
}

/// Reads the type tag without validating the payload.
///
/// Registration of the tag is not checked either, so dispatchers can branch
/// on it before deciding whether a full decode is worth doing.
pub fn peek_type(data: &[u8]) -> Result<String, DecodeError> {
    let envelope = read_envelope(data)?;
    let entries = envelope_entries(&envelope)?;
    read_tag(entries).map(str::to_owned)
}

fn read_envelope(data: &[u8]) -> Result<Value, DecodeError> {
    let mut rd = data;
    let value =
        rmpv::decode::read_value(&mut rd).map_err(|e| DecodeError::Format(e.to_string()))?;
    if !rd.is_empty() {
        return Err(DecodeError::Format(format!("{} trailing bytes", rd.len())));
    }
    Ok(value)
}

fn envelope_entries(envelope: &Value) -> Result<&[(Value, Value)], DecodeError> {
    envelope
        .as_map()
        .map(Vec::as_slice)
        .ok_or_else(|| DecodeError::Format("top-level value is not a map".to_string()))
}

fn read_tag(entries: &[(Value, Value)]) -> Result<&str, DecodeError> {
    lookup(entries, KEY_TYPE)
        .ok_or_else(|| DecodeError::Format("missing type tag".to_string()))?
        .as_str()
        .ok_or_else(|| DecodeError::Format("type tag is not a string".to_string()))
}

fn lookup<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn entry(key: &str, value: impl Into<Value>) -> (Value, Value) {
    (Value::from(key), value.into())
}

fn values_to_value(values: &Values) -> Value {
    Value::Map(
        values
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect(),
    )
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn next_command_id() -> String {
    static START: OnceLock<Instant> = OnceLock::new();
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let nanos = START.get_or_init(Instant::now).elapsed().as_nanos();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{nanos}-{seq}")
}
