//! LanShare peer: registry link, LAN discovery and direct file transfer, tied together by
//! [`PeerClient`].

pub mod client;
pub mod config;
pub mod discovery;
pub mod library;
pub mod metrics;
pub mod registry_client;
pub mod transfer;

pub use client::{ClientError, ClientState, PeerClient, RenameError};
pub use discovery::{LocalPeerProvider, UdpDiscovery};
pub use registry_client::{RegistryClient, RegistryClientError};
pub use transfer::{
    AcceptPolicy, FileReceived, FileReceiver, FileSender, MismatchPolicy, ReceiveOutcome, SendOutcome,
    TransferError, TransferOffer,
};
