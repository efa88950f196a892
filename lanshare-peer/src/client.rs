//! Peer client: owns the registry link, the discovery responder and the file receiver,
//! and keeps one published `PeerInfo` consistent across all three.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use lanshare_core::model::new_peer_id;
use lanshare_core::{net, ClientConfig, ConfigError, PeerInfo};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{LocalPeerProvider, UdpDiscovery};
use crate::library::scan_shared_files;
use crate::registry_client::{RegistryClient, RegistryClientError};
use crate::transfer::{
    AcceptPolicy, FileReceived, FileReceiver, FileSender, MismatchPolicy, ReceiverSettings, SendOutcome,
    TransferError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("file receiver failed to start: {0}")]
    Receiver(#[source] TransferError),
}

#[derive(Error, Debug)]
pub enum RenameError {
    #[error("username cannot be empty")]
    Blank,

    #[error("client has no published identity or its receiver is down")]
    NotReady,

    /// The new name was refused; the old registration is back in place.
    #[error("registration under the new name failed: {0}")]
    Rejected(String),

    /// The new name was refused and restoring the old registration failed too:
    /// this peer is registered nowhere.
    #[error("rename failed ({rename}) and restoring the previous registration failed ({restore})")]
    RecoveryFailed { rename: String, restore: String },
}

type Heartbeat = (CancellationToken, JoinHandle<()>);

pub struct PeerClient {
    config: RwLock<ClientConfig>,
    state: RwLock<ClientState>,
    /// Serializes start, stop and rename.
    lifecycle: tokio::sync::Mutex<()>,
    local: Arc<RwLock<Option<PeerInfo>>>,
    registry: Arc<RegistryClient>,
    discovery: UdpDiscovery,
    receiver: FileReceiver,
    sender: FileSender,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl PeerClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let registry = RegistryClient::new(
            config.server_endpoint()?,
            config.connect_timeout(),
            config.io_timeout(),
        );
        let target: IpAddr = match config.broadcast_address.as_deref() {
            Some(s) => s
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(s.to_owned()))?,
            None => net::broadcast_address().into(),
        };
        let discovery = UdpDiscovery::new(config.discovery_port, target, config.discovery_window());
        let receiver = FileReceiver::new(ReceiverSettings {
            download_directory: config.download_directory.clone(),
            buffer_size: config.buffer_size,
            accept_timeout: config.accept_timeout(),
            io_timeout: config.io_timeout(),
            mismatch_policy: if config.keep_mismatched_files {
                MismatchPolicy::Keep
            } else {
                MismatchPolicy::Delete
            },
        });
        let sender = FileSender {
            buffer_size: config.buffer_size,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
        };
        Ok(Self {
            config: RwLock::new(config),
            state: RwLock::new(ClientState::Stopped),
            lifecycle: tokio::sync::Mutex::new(()),
            local: Arc::new(RwLock::new(None)),
            registry: Arc::new(registry),
            discovery,
            receiver,
            sender,
            heartbeat: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ClientState::Running
    }

    pub fn username(&self) -> String {
        self.config.read().username.clone()
    }

    /// The descriptor currently published to the registry and discovery.
    pub fn local_peer(&self) -> Option<PeerInfo> {
        self.local.read().clone()
    }

    /// Actual file-transfer address (may differ from the configured port).
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.receiver.local_addr()
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.listener_addr()
    }

    pub fn set_accept_policy(&self, policy: AcceptPolicy) {
        self.receiver.set_policy(policy);
    }

    pub fn subscribe_received(&self) -> broadcast::Receiver<FileReceived> {
        self.receiver.subscribe()
    }

    fn set_state(&self, state: ClientState) {
        debug!(?state, "client state");
        *self.state.write() = state;
    }

    /// Start the receiver, publish the local descriptor and register. A registry failure is
    /// logged and tolerated; a receiver that cannot bind aborts the start.
    pub async fn start(&self) -> Result<(), ClientError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        self.set_state(ClientState::Starting);
        let cfg = self.config.read().clone();

        let addr = match self.receiver.start(cfg.listen_port, cfg.port_search_range).await {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "cannot start file receiver; not registering");
                self.set_state(ClientState::Stopped);
                return Err(ClientError::Receiver(e));
            }
        };

        let ip = cfg
            .advertised_ip
            .clone()
            .unwrap_or_else(|| net::local_ip().to_string());
        let mut me = PeerInfo::new(cfg.username.clone(), ip, addr.port());
        me.shared_files = scan_shared_files(&cfg.shared_directory).await;
        *self.local.write() = Some(me.clone());

        let local = self.local.clone();
        let provider: LocalPeerProvider = Arc::new(move || local.read().clone());
        self.discovery.set_provider(Some(provider));
        if let Err(e) = self.discovery.start_listener().await {
            warn!(port = cfg.discovery_port, error = %e, "discovery listener unavailable");
        }

        if let Err(e) = self.publish(&me).await {
            warn!(error = %e, "registration failed; continuing with LAN discovery only");
        }
        self.start_heartbeat(cfg.heartbeat_interval());
        self.set_state(ClientState::Running);
        info!(peer = %me, shared = me.shared_files.len(), "peer client running");
        Ok(())
    }

    /// Deregister and release every socket. Each step runs even if the previous one failed.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.state() == ClientState::Stopped {
            return;
        }
        self.set_state(ClientState::Stopping);
        self.stop_heartbeat().await;

        let peer_id = self
            .local
            .read()
            .as_ref()
            .map(|p| p.peer_id.clone())
            .filter(|id| !id.is_empty());
        if let Some(id) = peer_id {
            if let Err(e) = self.registry.deregister(&id).await {
                warn!(error = %e, "deregistration failed");
            }
        }
        self.registry.disconnect().await;
        self.receiver.stop().await;
        self.discovery.stop_listener().await;
        self.set_state(ClientState::Stopped);
        info!("peer client stopped");
    }

    /// Peers answering a LAN probe, excluding this client.
    pub async fn scan_lan(&self) -> Vec<PeerInfo> {
        let me = self.local.read().as_ref().map(|p| p.peer_id.clone());
        self.discovery
            .scan()
            .await
            .into_iter()
            .filter(|p| Some(&p.peer_id) != me.as_ref())
            .collect()
    }

    /// Online peers from the registry. Failures yield an empty list.
    pub async fn query_peers(&self, file_name_filter: Option<&str>) -> Vec<PeerInfo> {
        match self.registry.query_peers(file_name_filter).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "registry query failed");
                Vec::new()
            }
        }
    }

    /// Send `path` to `target`, given as `ip:port` or a username (registry first, then LAN scan).
    pub async fn send_file(&self, target: &str, path: &Path) -> bool {
        let Some(addr) = self.resolve(target).await else {
            warn!(%target, "peer not found");
            return false;
        };
        match self.sender.send_file(addr, path).await {
            Ok(SendOutcome::Delivered { bytes }) => {
                info!(%target, %addr, bytes, file = %path.display(), "file sent");
                true
            }
            Ok(SendOutcome::Rejected { reason }) => {
                info!(%target, reason = reason.as_deref().unwrap_or(""), "peer declined the file");
                false
            }
            Err(e) => {
                warn!(%target, %addr, error = %e, "send failed");
                false
            }
        }
    }

    async fn resolve(&self, target: &str) -> Option<SocketAddr> {
        let target = target.trim();
        if let Ok(addr) = target.parse::<SocketAddr>() {
            return Some(addr);
        }
        let by_name = |peers: Vec<PeerInfo>| {
            peers
                .into_iter()
                .find(|p| p.username == target)
                .and_then(|p| p.endpoint())
        };
        if let Some(addr) = by_name(self.query_peers(None).await) {
            return Some(addr);
        }
        debug!(%target, "not in registry, scanning LAN");
        by_name(self.scan_lan().await)
    }

    /// Rename this peer. While running this is deregister-old, register-new, and on failure
    /// re-register-old; see [`RenameError`] for how each failure leaves the client.
    pub async fn change_username(&self, new_name: &str) -> Result<(), RenameError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(RenameError::Blank);
        }
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            self.config.write().username = new_name.to_owned();
            return Ok(());
        }
        let old = match self.local.read().clone() {
            Some(p) if self.receiver.is_running() => p,
            _ => return Err(RenameError::NotReady),
        };

        if !old.peer_id.is_empty() {
            if let Err(e) = self.registry.deregister(&old.peer_id).await {
                warn!(error = %e, "deregistering old name failed");
            }
        }

        let shared_dir = self.config.read().shared_directory.clone();
        let mut renamed = old.clone();
        renamed.username = new_name.to_owned();
        renamed.peer_id = new_peer_id();
        renamed.shared_files = scan_shared_files(&shared_dir).await;
        *self.local.write() = Some(renamed.clone());

        let failure = match self.publish(&renamed).await {
            Ok(()) => {
                self.config.write().username = new_name.to_owned();
                info!(from = %old.username, to = %new_name, "username changed");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(error = %failure, "new name refused, restoring {}", old.username);
        *self.local.write() = Some(old.clone());
        match self.publish(&old).await {
            Ok(()) => Err(RenameError::Rejected(failure.to_string())),
            Err(restore) => {
                error!(error = %restore, "could not restore previous registration");
                Err(RenameError::RecoveryFailed {
                    rename: failure.to_string(),
                    restore: restore.to_string(),
                })
            }
        }
    }

    /// Register `me` and adopt the peerId the registry kept.
    async fn publish(&self, me: &PeerInfo) -> Result<(), RegistryClientError> {
        let stored = self.registry.register(me).await?;
        if stored != me.peer_id {
            debug!(%stored, "registry kept an existing peer id");
            if let Some(local) = self.local.write().as_mut() {
                local.peer_id = stored;
            }
        }
        Ok(())
    }

    fn start_heartbeat(&self, period: std::time::Duration) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let registry = self.registry.clone();
        let local = self.local.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let id = local.read().as_ref().map(|p| p.peer_id.clone());
                        let Some(id) = id else { continue };
                        if let Err(e) = registry.heartbeat(&id).await {
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });
        if let Some((old, _)) = self.heartbeat.lock().replace((cancel, task)) {
            old.cancel();
        }
    }

    async fn stop_heartbeat(&self) {
        let Some((cancel, task)) = self.heartbeat.lock().take() else {
            return;
        };
        cancel.cancel();
        let _ = task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_core::checksum::sha256_file;
    use lanshare_core::wire::{receive_message, send_message};
    use lanshare_core::{Body, Message, ServerConfig};
    use lanshare_registry::RegistryServer;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const T: Duration = Duration::from_secs(5);

    async fn registry() -> (SocketAddr, Arc<lanshare_registry::PeerRegistry>, CancellationToken) {
        let server = RegistryServer::bind(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, server.local_addr().unwrap().port()));
        let reg = server.registry();
        let token = server.shutdown_token();
        tokio::spawn(server.run());
        (addr, reg, token)
    }

    async fn dead_addr() -> SocketAddr {
        let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        l.local_addr().unwrap()
    }

    fn config(name: &str, server: SocketAddr, root: &Path) -> ClientConfig {
        ClientConfig {
            server_address: server.ip().to_string(),
            server_port: server.port(),
            listen_port: 0,
            discovery_port: 0,
            username: name.into(),
            shared_directory: root.join("shared"),
            download_directory: root.join("downloads"),
            advertised_ip: Some("127.0.0.1".into()),
            broadcast_address: Some("127.0.0.1".into()),
            discovery_window_ms: 500,
            accept_timeout_secs: 5,
            connect_timeout_secs: 2,
            io_timeout_secs: 5,
            ..ClientConfig::default()
        }
    }

    fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, (0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>()).unwrap();
        path
    }

    #[tokio::test]
    async fn start_registers_and_stop_deregisters() {
        let (addr, reg, token) = registry().await;
        let root = tempfile::tempdir().unwrap();
        write_file(&root.path().join("shared"), "notes.txt", 10);
        let client = PeerClient::new(config("alice", addr, root.path())).unwrap();

        client.start().await.unwrap();
        client.start().await.unwrap();
        assert!(client.is_running());
        let me = client.local_peer().unwrap();
        assert_eq!(me.listen_port, client.listen_addr().unwrap().port());

        let peers = reg.get_all_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, me.peer_id);
        assert_eq!(client.query_peers(Some("NOTES.TXT")).await.len(), 1);
        assert!(client.query_peers(Some("other")).await.is_empty());

        client.stop().await;
        assert_eq!(client.state(), ClientState::Stopped);
        // deregistration has no reply; give the registry a moment to apply it
        for _ in 0..50 {
            if reg.peer_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(reg.peer_count(), 0);
        assert!(client.listen_addr().is_none());
        token.cancel();
    }

    #[tokio::test]
    async fn send_by_username_through_registry() {
        let (addr, _reg, token) = registry().await;
        let a_root = tempfile::tempdir().unwrap();
        let b_root = tempfile::tempdir().unwrap();
        let alice = PeerClient::new(config("alice", addr, a_root.path())).unwrap();
        let bob = PeerClient::new(config("bob", addr, b_root.path())).unwrap();
        bob.set_accept_policy(AcceptPolicy::accept_all());
        let mut received = bob.subscribe_received();
        alice.start().await.unwrap();
        bob.start().await.unwrap();

        let file = write_file(a_root.path(), "photo.jpg", 250_000);
        assert!(alice.send_file("bob", &file).await);

        let ev = tokio::time::timeout(T, received.recv()).await.unwrap().unwrap();
        assert_eq!(ev.file_name, "photo.jpg");
        assert_eq!(ev.saved_path, b_root.path().join("downloads/photo.jpg"));
        assert_eq!(
            sha256_file(&ev.saved_path).await.unwrap(),
            sha256_file(&file).await.unwrap()
        );

        // second copy never overwrites the first
        let direct = format!("127.0.0.1:{}", bob.listen_addr().unwrap().port());
        assert!(alice.send_file(&direct, &file).await);
        let ev = tokio::time::timeout(T, received.recv()).await.unwrap().unwrap();
        assert_eq!(ev.saved_path, b_root.path().join("downloads/photo_1.jpg"));

        assert!(!alice.send_file("nobody", &file).await);

        alice.stop().await;
        bob.stop().await;
        token.cancel();
    }

    #[tokio::test]
    async fn rejected_offer_reports_failure() {
        let (addr, _reg, token) = registry().await;
        let a_root = tempfile::tempdir().unwrap();
        let b_root = tempfile::tempdir().unwrap();
        let alice = PeerClient::new(config("alice", addr, a_root.path())).unwrap();
        let bob = PeerClient::new(config("bob", addr, b_root.path())).unwrap();
        alice.start().await.unwrap();
        bob.start().await.unwrap();

        let file = write_file(a_root.path(), "x.bin", 1000);
        assert!(!alice.send_file("bob", &file).await);
        assert!(!b_root.path().join("downloads/x.bin").exists());
        alice.stop().await;
        bob.stop().await;
        token.cancel();
    }

    #[tokio::test]
    async fn runs_without_registry_and_falls_back_to_lan_scan() {
        let dead = dead_addr().await;
        let a_root = tempfile::tempdir().unwrap();
        let b_root = tempfile::tempdir().unwrap();

        let alice = PeerClient::new(config("alice", dead, a_root.path())).unwrap();
        alice.set_accept_policy(AcceptPolicy::accept_all());
        alice.start().await.unwrap();
        assert!(alice.is_running());
        // its own listener answers, but it never lists itself
        assert!(alice.scan_lan().await.is_empty());

        // bob probes alice's discovery port; his own listener cannot bind it and that is fine
        let mut cfg = config("bob", dead, b_root.path());
        cfg.discovery_port = alice.discovery_addr().unwrap().port();
        let bob = PeerClient::new(cfg).unwrap();
        bob.start().await.unwrap();
        let seen = bob.scan_lan().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].username, "alice");

        let mut received = alice.subscribe_received();
        let file = write_file(b_root.path(), "hello.txt", 42);
        assert!(bob.send_file("alice", &file).await);
        let ev = tokio::time::timeout(T, received.recv()).await.unwrap().unwrap();
        assert_eq!(ev.file_name, "hello.txt");

        bob.stop().await;
        alice.stop().await;
    }

    #[tokio::test]
    async fn rename_while_running_reissues_peer_id() {
        let (addr, reg, token) = registry().await;
        let root = tempfile::tempdir().unwrap();
        let client = PeerClient::new(config("alice", addr, root.path())).unwrap();
        client.start().await.unwrap();
        let before = client.local_peer().unwrap();

        assert!(matches!(client.change_username("  ").await, Err(RenameError::Blank)));
        client.change_username("alicia").await.unwrap();

        let after = client.local_peer().unwrap();
        assert_eq!(after.username, "alicia");
        assert_ne!(after.peer_id, before.peer_id);
        assert_eq!(client.username(), "alicia");
        let names: Vec<_> = reg.get_all_peers().into_iter().map(|p| p.username).collect();
        assert_eq!(names, vec!["alicia"]);

        // discovery answers with the new identity too
        let port = client.discovery_addr().unwrap().port();
        let probe = UdpDiscovery::new(port, Ipv4Addr::LOCALHOST.into(), Duration::from_millis(500));
        assert_eq!(probe.scan().await[0].username, "alicia");

        client.stop().await;
        token.cancel();
    }

    #[tokio::test]
    async fn rename_when_stopped_only_updates_config() {
        let root = tempfile::tempdir().unwrap();
        let client = PeerClient::new(config("alice", dead_addr().await, root.path())).unwrap();
        client.change_username("bob").await.unwrap();
        assert_eq!(client.username(), "bob");
        assert!(client.local_peer().is_none());
    }

    /// Registry stand-in that refuses one username and accepts everything else.
    async fn picky_registry(refuse: &'static str) -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut s, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    while let Ok(Some(msg)) = receive_message(&mut s, T).await {
                        let reply = match msg.body {
                            Body::Register { peer_info } if peer_info.username == refuse => {
                                Message::register_nack("name not allowed")
                            }
                            Body::Register { peer_info } => Message::register_ack(peer_info.peer_id),
                            _ => continue,
                        };
                        if send_message(&mut s, &reply, T).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn refused_rename_restores_old_identity() {
        let addr = picky_registry("mallory").await;
        let root = tempfile::tempdir().unwrap();
        let client = PeerClient::new(config("alice", addr, root.path())).unwrap();
        client.start().await.unwrap();
        let before = client.local_peer().unwrap();

        let err = client.change_username("mallory").await.unwrap_err();
        assert!(matches!(err, RenameError::Rejected(ref r) if r.contains("name not allowed")));
        let after = client.local_peer().unwrap();
        assert_eq!(after.username, "alice");
        assert_eq!(after.peer_id, before.peer_id);
        assert_eq!(client.username(), "alice");
        client.stop().await;
    }

    #[tokio::test]
    async fn rename_with_registry_gone_surfaces_recovery_failure() {
        let (addr, _reg, token) = registry().await;
        let root = tempfile::tempdir().unwrap();
        let client = PeerClient::new(config("alice", addr, root.path())).unwrap();
        client.start().await.unwrap();

        token.cancel();
        client.registry.disconnect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = client.change_username("bob").await.unwrap_err();
        assert!(matches!(err, RenameError::RecoveryFailed { .. }), "{err}");
        assert_eq!(client.local_peer().unwrap().username, "alice");
        client.stop().await;
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[tokio::test]
    async fn receiver_port_conflict_aborts_start() {
        let root = tempfile::tempdir().unwrap();
        let blocker = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let mut cfg = config("alice", dead_addr().await, root.path());
        cfg.listen_port = blocker.local_addr().unwrap().port();
        cfg.port_search_range = 0;
        let client = PeerClient::new(cfg).unwrap();
        assert!(matches!(client.start().await, Err(ClientError::Receiver(_))));
        assert_eq!(client.state(), ClientState::Stopped);
        assert!(client.local_peer().is_none());
    }
}
