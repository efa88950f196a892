//! Registry and peer configuration with validation. Loading (file, env) lives in the daemons.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::{
    ACCEPT_PROMPT_TIMEOUT, CLEANUP_INTERVAL, CONNECTION_TIMEOUT, DEFAULT_BUFFER_SIZE,
    DEFAULT_CLIENT_LISTEN_PORT, DEFAULT_DISCOVERY_PORT, DEFAULT_PEER_TIMEOUT, DEFAULT_SERVER_PORT,
    DISCOVERY_WINDOW, HEARTBEAT_INTERVAL, READ_WRITE_TIMEOUT,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be between 1 and 65535")]
    PortOutOfRange(&'static str),
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("{field} must be at least {min}")]
    TooSmall { field: &'static str, min: u64 },
}

/// Registry server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// TCP listen port. 0 binds an ephemeral port.
    pub port: u16,
    /// Peer TTL in seconds.
    pub peer_timeout_secs: u64,
    pub max_peers: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
            peer_timeout_secs: DEFAULT_PEER_TIMEOUT.as_secs(),
            max_peers: 1000,
            cleanup_interval_secs: CLEANUP_INTERVAL.as_secs(),
        }
    }
}

impl ServerConfig {
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_timeout_secs == 0 {
            return Err(ConfigError::TooSmall {
                field: "peer_timeout_secs",
                min: 1,
            });
        }
        if self.max_peers < 1 {
            return Err(ConfigError::TooSmall {
                field: "max_peers",
                min: 1,
            });
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::TooSmall {
                field: "cleanup_interval_secs",
                min: 1,
            });
        }
        Ok(())
    }
}

/// Peer client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub server_address: String,
    pub server_port: u16,
    /// File-transfer TCP port. 0 binds an ephemeral port.
    pub listen_port: u16,
    /// UDP discovery port. 0 binds an ephemeral port (listener only reachable when probed directly).
    pub discovery_port: u16,
    pub username: String,
    pub shared_directory: PathBuf,
    pub download_directory: PathBuf,
    pub heartbeat_interval_secs: u64,
    pub buffer_size: usize,
    /// Address advertised to the registry and discovery; auto-detected when unset.
    pub advertised_ip: Option<String>,
    /// Discovery probe target; subnet broadcast when unset.
    pub broadcast_address: Option<String>,
    pub discovery_window_ms: u64,
    pub accept_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    /// How many ports above `listen_port` to try when it is taken.
    pub port_search_range: u16,
    /// Keep a received file whose checksum does not match.
    pub keep_mismatched_files: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_owned(),
            server_port: DEFAULT_SERVER_PORT,
            listen_port: DEFAULT_CLIENT_LISTEN_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            username: default_username(),
            shared_directory: PathBuf::from("shared"),
            download_directory: PathBuf::from("downloads"),
            heartbeat_interval_secs: HEARTBEAT_INTERVAL.as_secs(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            advertised_ip: None,
            broadcast_address: None,
            discovery_window_ms: DISCOVERY_WINDOW.as_millis() as u64,
            accept_timeout_secs: ACCEPT_PROMPT_TIMEOUT.as_secs(),
            connect_timeout_secs: CONNECTION_TIMEOUT.as_secs(),
            io_timeout_secs: READ_WRITE_TIMEOUT.as_secs(),
            port_search_range: 100,
            keep_mismatched_files: true,
        }
    }
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "peer".to_owned())
}

impl ClientConfig {
    pub fn server_endpoint(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .server_address
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.server_address.clone()))?;
        Ok(SocketAddr::new(ip, self.server_port))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_endpoint()?;
        if self.server_port == 0 {
            return Err(ConfigError::PortOutOfRange("server_port"));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::EmptyUsername);
        }
        if self.heartbeat_interval_secs < 10 {
            return Err(ConfigError::TooSmall {
                field: "heartbeat_interval_secs",
                min: 10,
            });
        }
        if self.buffer_size < 1024 {
            return Err(ConfigError::TooSmall {
                field: "buffer_size",
                min: 1024,
            });
        }
        for addr in [&self.advertised_ip, &self.broadcast_address].into_iter().flatten() {
            if addr.trim().parse::<IpAddr>().is_err() {
                return Err(ConfigError::InvalidAddress(addr.clone()));
            }
        }
        if self.accept_timeout_secs == 0 {
            return Err(ConfigError::TooSmall {
                field: "accept_timeout_secs",
                min: 1,
            });
        }
        Ok(())
    }
}
