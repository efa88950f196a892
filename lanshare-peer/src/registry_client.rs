//! Persistent link to the registry server. Requests are strictly sequential.

use std::net::SocketAddr;
use std::time::Duration;

use lanshare_core::wire::{receive_message, send_message, WireError};
use lanshare_core::{Body, Message, MessageType, PeerInfo};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Error, Debug)]
pub enum RegistryClientError {
    #[error("cannot reach registry at {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("registry closed the connection")]
    Closed,

    #[error("registration refused: {0}")]
    Rejected(String),

    #[error("unexpected {0} from registry")]
    Unexpected(MessageType),
}

impl RegistryClientError {
    /// Worth one reconnect: the cached connection may simply have gone stale.
    fn is_link_failure(&self) -> bool {
        matches!(
            self,
            RegistryClientError::Closed | RegistryClientError::Wire(WireError::Io(_))
        )
    }
}

pub struct RegistryClient {
    addr: SocketAddr,
    connect_timeout: Duration,
    io_timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl RegistryClient {
    pub fn new(addr: SocketAddr, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            addr,
            connect_timeout,
            io_timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register (or refresh) `info`. Returns the peerId the registry stored, which is the
    /// previously stored one when the username was already registered.
    pub async fn register(&self, info: &PeerInfo) -> Result<String, RegistryClientError> {
        let resp = self.round_trip(Message::register(info.clone())).await?;
        match resp.body {
            Body::RegisterAck { peer_id } => Ok(peer_id),
            Body::RegisterNack { reason } => Err(RegistryClientError::Rejected(reason)),
            other => Err(RegistryClientError::Unexpected(other.kind())),
        }
    }

    pub async fn query_peers(&self, file_name_filter: Option<&str>) -> Result<Vec<PeerInfo>, RegistryClientError> {
        let resp = self
            .round_trip(Message::query_peers(file_name_filter.map(str::to_owned)))
            .await?;
        match resp.body {
            Body::QueryResponse { peers } => Ok(peers),
            other => Err(RegistryClientError::Unexpected(other.kind())),
        }
    }

    pub async fn deregister(&self, peer_id: &str) -> Result<(), RegistryClientError> {
        self.notify(Message::deregister(peer_id)).await
    }

    pub async fn heartbeat(&self, peer_id: &str) -> Result<(), RegistryClientError> {
        self.notify(Message::heartbeat(peer_id)).await
    }

    /// Drop the cached connection.
    pub async fn disconnect(&self) {
        self.conn.lock().await.take();
    }

    async fn round_trip(&self, msg: Message) -> Result<Message, RegistryClientError> {
        self.exchange(&msg, true)
            .await?
            .ok_or(RegistryClientError::Closed)
    }

    async fn notify(&self, msg: Message) -> Result<(), RegistryClientError> {
        self.exchange(&msg, false).await.map(|_| ())
    }

    /// Send `msg` (and read one reply if asked) on the cached connection, reconnecting once
    /// if the link turns out to be dead.
    async fn exchange(&self, msg: &Message, want_reply: bool) -> Result<Option<Message>, RegistryClientError> {
        let mut conn = self.conn.lock().await;
        let mut retried = false;
        loop {
            if conn.is_none() {
                *conn = Some(self.connect().await?);
            }
            let Some(stream) = conn.as_mut() else {
                continue;
            };
            match self.try_exchange(stream, msg, want_reply).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    *conn = None;
                    if retried || !e.is_link_failure() {
                        return Err(e);
                    }
                    debug!(error = %e, "registry link lost, reconnecting");
                    retried = true;
                }
            }
        }
    }

    async fn try_exchange(
        &self,
        stream: &mut TcpStream,
        msg: &Message,
        want_reply: bool,
    ) -> Result<Option<Message>, RegistryClientError> {
        send_message(stream, msg, self.io_timeout).await?;
        if !want_reply {
            return Ok(None);
        }
        match receive_message(stream, self.io_timeout).await? {
            Some(reply) => Ok(Some(reply)),
            None => Err(RegistryClientError::Closed),
        }
    }

    async fn connect(&self) -> Result<TcpStream, RegistryClientError> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(RegistryClientError::Connect {
                    addr: self.addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(RegistryClientError::Connect {
                    addr: self.addr,
                    reason: "timed out".into(),
                })
            }
        };
        let _ = stream.set_nodelay(true);
        debug!(addr = %self.addr, "connected to registry");
        Ok(stream)
    }
}
