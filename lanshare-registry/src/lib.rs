//! LanShare registry server: in-memory peer directory with heartbeat-based expiry,
//! served over the length-prefixed JSON protocol.

pub mod config;
pub mod handler;
pub mod registry;
pub mod server;

pub use handler::{handle_connection, handle_message};
pub use registry::{PeerRegistry, RegistrationError};
pub use server::RegistryServer;
