//! LAN discovery over UDP: broadcast a probe, collect `PEER:<json>` replies; answer probes
//! from other peers with the local descriptor.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lanshare_core::net::local_ip;
use lanshare_core::protocol::{DISCOVERY_PROBE, DISCOVERY_REPLY_PREFIX};
use futures::stream::{self, Stream, StreamExt};
use lanshare_core::PeerInfo;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_GAP: Duration = Duration::from_millis(200);
const MAX_DATAGRAM: usize = 64 * 1024;
const MAX_RECV_ERRORS: u32 = 8;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(20);

/// Returns the current local descriptor, or `None` to stay silent.
pub type LocalPeerProvider = Arc<dyn Fn() -> Option<PeerInfo> + Send + Sync>;

struct Listener {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct UdpDiscovery {
    port: u16,
    target: IpAddr,
    window: Duration,
    provider: Arc<RwLock<Option<LocalPeerProvider>>>,
    listener: Mutex<Option<Listener>>,
}

impl UdpDiscovery {
    /// `port` is both the probe destination and the listener port (0 = ephemeral listener,
    /// in which case scans target the listener's actual port). `target` is where probes go,
    /// normally the subnet broadcast address.
    pub fn new(port: u16, target: IpAddr, window: Duration) -> Self {
        Self {
            port,
            target,
            window,
            provider: Arc::new(RwLock::new(None)),
            listener: Mutex::new(None),
        }
    }

    pub fn set_provider(&self, provider: Option<LocalPeerProvider>) {
        *self.provider.write() = provider;
    }

    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.addr)
    }

    fn scan_port(&self) -> Option<u16> {
        match self.port {
            0 => self.listener_addr().map(|a| a.port()),
            p => Some(p),
        }
    }

    /// Probe twice, then collect replies for the discovery window. Deduplicated by peerId
    /// (or `ip:port` when the id is blank). Socket failures yield an empty list.
    pub async fn scan(&self) -> Vec<PeerInfo> {
        let Some(port) = self.scan_port() else {
            warn!("discovery port unknown; skipping scan");
            return Vec::new();
        };
        match self.scan_inner(SocketAddr::new(self.target, port)).await {
            Ok(peers) => {
                info!(found = peers.len(), "lan scan complete");
                peers
            }
            Err(e) => {
                warn!(error = %e, "lan scan failed");
                Vec::new()
            }
        }
    }

    async fn scan_inner(&self, dest: SocketAddr) -> std::io::Result<Vec<PeerInfo>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        socket.send_to(DISCOVERY_PROBE.as_bytes(), dest).await?;
        tokio::time::sleep(PROBE_GAP).await;
        socket.send_to(DISCOVERY_PROBE.as_bytes(), dest).await?;
        debug!(%dest, "probes sent");

        let deadline = Instant::now() + self.window;
        let replies = stream::unfold(
            (&socket, vec![0u8; MAX_DATAGRAM]),
            |(socket, mut buf)| async move {
                let datagram = socket.recv_from(&mut buf).await.map(|(n, _from)| buf[..n].to_vec());
                Some((datagram, (socket, buf)))
            },
        );
        Ok(collect_replies(replies, deadline).await)
    }

    /// Bind the discovery port and answer probes until [`stop_listener`](Self::stop_listener).
    /// Returns the bound address; a second call while listening returns the existing one.
    pub async fn start_listener(&self) -> std::io::Result<SocketAddr> {
        if let Some(addr) = self.listener_addr() {
            return Ok(addr);
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        let addr = socket.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen_loop(socket, self.provider.clone(), cancel.clone()));
        info!(%addr, "discovery listener started");

        let mut slot = self.listener.lock();
        if let Some(existing) = slot.as_ref() {
            // lost a start race; keep the first listener
            cancel.cancel();
            return Ok(existing.addr);
        }
        *slot = Some(Listener { addr, cancel, task });
        Ok(addr)
    }

    /// Cancel the pending receive and release the socket. No-op when not listening.
    pub async fn stop_listener(&self) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        listener.cancel.cancel();
        let _ = listener.task.await;
        info!(addr = %listener.addr, "discovery listener stopped");
    }
}

impl Drop for UdpDiscovery {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.cancel.cancel();
        }
    }
}

/// Fold reply datagrams into a deduplicated peer list until `deadline` or the end of
/// the stream. A socket that keeps failing ends the scan early.
async fn collect_replies<S>(replies: S, deadline: Instant) -> Vec<PeerInfo>
where
    S: Stream<Item = std::io::Result<Vec<u8>>>,
{
    let mut replies = std::pin::pin!(replies);
    let mut seen = HashSet::new();
    let mut peers = Vec::new();
    let mut errors = 0;
    loop {
        let datagram = match tokio::time::timeout_at(deadline, replies.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some(Ok(datagram))) => {
                errors = 0;
                datagram
            }
            // e.g. ICMP port unreachable surfacing on some platforms
            Ok(Some(Err(e))) => {
                errors += 1;
                if errors >= MAX_RECV_ERRORS {
                    warn!(error = %e, "discovery socket keeps failing, ending scan early");
                    break;
                }
                debug!(error = %e, "discovery recv error");
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                continue;
            }
        };
        let Some(peer) = parse_reply(&datagram) else {
            continue;
        };
        if seen.insert(dedup_key(&peer)) {
            peers.push(peer);
        }
    }
    peers
}

async fn listen_loop(
    socket: UdpSocket,
    provider: Arc<RwLock<Option<LocalPeerProvider>>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 1024];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "discovery listener recv error");
                    continue;
                }
            },
        };
        if &buf[..n] != DISCOVERY_PROBE.as_bytes() {
            continue;
        }
        let provider = provider.read().clone();
        let Some(mut me) = provider.and_then(|p| p()) else {
            continue;
        };
        if me.ip_address.trim().is_empty() {
            me.ip_address = local_ip().to_string();
        }
        let Some(reply) = encode_reply(&me) else {
            continue;
        };
        if let Err(e) = socket.send_to(&reply, from).await {
            debug!(%from, error = %e, "discovery reply failed");
        }
    }
}

fn encode_reply(peer: &PeerInfo) -> Option<Vec<u8>> {
    let json = serde_json::to_vec(peer).ok()?;
    let mut out = Vec::with_capacity(DISCOVERY_REPLY_PREFIX.len() + json.len());
    out.extend_from_slice(DISCOVERY_REPLY_PREFIX.as_bytes());
    out.extend_from_slice(&json);
    Some(out)
}

/// Parse a `PEER:<json>` datagram. Anything else is `None`.
pub fn parse_reply(datagram: &[u8]) -> Option<PeerInfo> {
    let json = datagram.strip_prefix(DISCOVERY_REPLY_PREFIX.as_bytes())?;
    serde_json::from_slice(json).ok()
}

fn dedup_key(peer: &PeerInfo) -> String {
    if peer.peer_id.trim().is_empty() {
        format!("{}:{}", peer.ip_address, peer.listen_port)
    } else {
        peer.peer_id.clone()
    }
}
