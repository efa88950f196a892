//! LanShare protocol reference implementation.
//! Shared by the registry server and the peer client: message types, framing,
//! data model, checksums, network helpers and configuration.

pub mod checksum;
pub mod config;
pub mod model;
pub mod net;
pub mod protocol;
pub mod wire;

pub use checksum::{ChecksumAlgorithm, ChecksumError};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use model::{PeerInfo, PeerRegistration, SharedFile};
pub use protocol::{Body, Message, MessageType, PROTOCOL_VERSION};
pub use wire::{
    decode_frame, deserialize, encode_frame, receive_message, send_message, serialize,
    FrameDecodeError, FrameEncodeError, WireError,
};
