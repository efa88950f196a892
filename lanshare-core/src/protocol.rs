//! LanShare wire protocol: message types, envelope, protocol constants.
//!
//! Every TCP exchange (registry and peer-to-peer) carries one JSON envelope per frame:
//! `{"type": "<MessageType>", "data": {...}}`. The shape of `data` is fully determined by
//! `type`; `timestamp` and `messageId` ride along inside `data`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::model::{PeerInfo, PeerRegistration};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default registry server TCP port.
pub const DEFAULT_SERVER_PORT: u16 = 5000;
/// Default peer file-transfer TCP port.
pub const DEFAULT_CLIENT_LISTEN_PORT: u16 = 5001;
/// Default UDP discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5002;

/// Silence after which a registered peer is considered offline.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Interval between peer heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Interval of the registry TTL sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Default file transfer buffer (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
/// Large file transfer buffer (1 MiB).
pub const LARGE_BUFFER_SIZE: usize = 1024 * 1024;

/// Bounded TCP connect.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounded per-operation read/write.
pub const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
/// Interactive accept prompt; expiry means reject.
pub const ACCEPT_PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest accepted frame payload (10 MiB).
pub const MAX_MESSAGE_LEN: u32 = 10 * 1024 * 1024;

/// UDP discovery probe, sent as plain ASCII.
pub const DISCOVERY_PROBE: &str = "DISCOVER_P2P_V1?";
/// Prefix of a discovery reply; followed by the JSON `PeerInfo`.
pub const DISCOVERY_REPLY_PREFIX: &str = "PEER:";
/// Collection window of one LAN scan.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(3);

/// Message kinds. The string form is the `type` tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Register,
    Deregister,
    QueryPeers,
    Heartbeat,
    RegisterAck,
    RegisterNack,
    QueryResponse,
    FileTransferRequest,
    FileTransferResponse,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::Register,
        MessageType::Deregister,
        MessageType::QueryPeers,
        MessageType::Heartbeat,
        MessageType::RegisterAck,
        MessageType::RegisterNack,
        MessageType::QueryResponse,
        MessageType::FileTransferRequest,
        MessageType::FileTransferResponse,
    ];

    /// Parse a wire tag, ignoring ASCII case.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(tag.trim()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "Register",
            MessageType::Deregister => "Deregister",
            MessageType::QueryPeers => "QueryPeers",
            MessageType::Heartbeat => "Heartbeat",
            MessageType::RegisterAck => "RegisterAck",
            MessageType::RegisterNack => "RegisterNack",
            MessageType::QueryResponse => "QueryResponse",
            MessageType::FileTransferRequest => "FileTransferRequest",
            MessageType::FileTransferResponse => "FileTransferResponse",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed message payload. Adjacently tagged so it maps 1:1 onto `{type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum Body {
    /// Client -> registry: publish presence.
    Register { peer_info: PeerRegistration },
    /// Registry -> client: registration accepted; carries the stored peer ID.
    RegisterAck { peer_id: String },
    /// Registry -> client: registration refused, human-readable reason.
    RegisterNack { reason: String },
    /// Client -> registry: graceful leave. No response.
    Deregister { peer_id: String },
    /// Client -> registry: list online peers, optionally only those sharing a file.
    QueryPeers {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name_filter: Option<String>,
    },
    /// Registry -> client.
    QueryResponse {
        #[serde(default)]
        peers: Vec<PeerInfo>,
    },
    /// Client -> registry: liveness refresh. No response.
    Heartbeat { peer_id: String },
    /// Sender -> receiver: offer a file.
    FileTransferRequest {
        file_name: String,
        file_size: u64,
        #[serde(default)]
        checksum: String,
    },
    /// Receiver -> sender: accept or reject the offer.
    FileTransferResponse {
        accepted: bool,
        file_name: String,
        file_size: u64,
        #[serde(default)]
        checksum: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

impl Body {
    pub fn kind(&self) -> MessageType {
        match self {
            Body::Register { .. } => MessageType::Register,
            Body::RegisterAck { .. } => MessageType::RegisterAck,
            Body::RegisterNack { .. } => MessageType::RegisterNack,
            Body::Deregister { .. } => MessageType::Deregister,
            Body::QueryPeers { .. } => MessageType::QueryPeers,
            Body::QueryResponse { .. } => MessageType::QueryResponse,
            Body::Heartbeat { .. } => MessageType::Heartbeat,
            Body::FileTransferRequest { .. } => MessageType::FileTransferRequest,
            Body::FileTransferResponse { .. } => MessageType::FileTransferResponse,
        }
    }
}

/// Message envelope: per-message metadata plus the typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub body: Body,
}

impl Message {
    /// Wrap a body with a fresh message ID and the current time.
    pub fn new(body: Body) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.body.kind()
    }

    pub fn register(peer_info: PeerInfo) -> Self {
        Self::new(Body::Register {
            peer_info: peer_info.into(),
        })
    }

    pub fn register_ack(peer_id: impl Into<String>) -> Self {
        Self::new(Body::RegisterAck {
            peer_id: peer_id.into(),
        })
    }

    pub fn register_nack(reason: impl Into<String>) -> Self {
        Self::new(Body::RegisterNack {
            reason: reason.into(),
        })
    }

    pub fn deregister(peer_id: impl Into<String>) -> Self {
        Self::new(Body::Deregister {
            peer_id: peer_id.into(),
        })
    }

    pub fn query_peers(file_name_filter: Option<String>) -> Self {
        Self::new(Body::QueryPeers { file_name_filter })
    }

    pub fn query_response(peers: Vec<PeerInfo>) -> Self {
        Self::new(Body::QueryResponse { peers })
    }

    pub fn heartbeat(peer_id: impl Into<String>) -> Self {
        Self::new(Body::Heartbeat {
            peer_id: peer_id.into(),
        })
    }

    pub fn transfer_request(file_name: impl Into<String>, file_size: u64, checksum: impl Into<String>) -> Self {
        Self::new(Body::FileTransferRequest {
            file_name: file_name.into(),
            file_size,
            checksum: checksum.into(),
        })
    }

    pub fn transfer_response(
        accepted: bool,
        file_name: impl Into<String>,
        file_size: u64,
        checksum: impl Into<String>,
        error_message: Option<String>,
    ) -> Self {
        Self::new(Body::FileTransferResponse {
            accepted,
            file_name: file_name.into(),
            file_size,
            checksum: checksum.into(),
            error_message,
        })
    }

    /// Encode as the JSON envelope `{"type": .., "data": {.., "timestamp", "messageId"}}`.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut value = serde_json::to_value(&self.body)?;
        if let Some(data) = value.get_mut("data").and_then(Value::as_object_mut) {
            data.insert("timestamp".to_owned(), serde_json::to_value(self.timestamp)?);
            data.insert(
                "messageId".to_owned(),
                Value::String(self.message_id.clone()),
            );
        }
        serde_json::to_vec(&value)
    }

    /// Decode a JSON envelope. `None` on malformed JSON, a missing `data` object,
    /// an unknown `type` tag or a `data` shape that does not match the tag.
    ///
    /// Envelope keys and the tag are matched ignoring case, and `PascalCase` field names
    /// inside `data` are accepted alongside `camelCase`.
    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        let Value::Object(mut envelope) = serde_json::from_slice(bytes).ok()? else {
            return None;
        };
        let kind = MessageType::parse(take_key(&mut envelope, "type")?.as_str()?)?;
        let mut data = take_key(&mut envelope, "data")?;
        camel_case_keys(&mut data);
        let fields = data.as_object_mut()?;
        let message_id = match fields.remove("messageId") {
            Some(Value::String(id)) => id,
            _ => String::new(),
        };
        let timestamp = fields
            .remove("timestamp")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(Utc::now);
        let body: Body = serde_json::from_value(json!({ "type": kind.as_str(), "data": data })).ok()?;
        Some(Self {
            message_id,
            timestamp,
            body,
        })
    }
}

fn take_key(map: &mut Map<String, Value>, key: &str) -> Option<Value> {
    let found = map.keys().find(|k| k.eq_ignore_ascii_case(key))?.clone();
    map.remove(&found)
}

fn camel_case_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, mut v) in std::mem::take(map) {
                camel_case_keys(&mut v);
                map.insert(lower_first(&key), v);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(camel_case_keys),
        _ => {}
    }
}

fn lower_first(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
