//! Registry TCP server: accept loop, one task per connection, periodic TTL sweep.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use lanshare_core::protocol::READ_WRITE_TIMEOUT;
use lanshare_core::ServerConfig;
use tokio::net::TcpListener;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::handle_connection;
use crate::registry::PeerRegistry;

pub struct RegistryServer {
    listener: TcpListener,
    registry: Arc<PeerRegistry>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl RegistryServer {
    /// Bind `0.0.0.0:<config.port>`.
    pub async fn bind(config: ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
        let registry = Arc::new(PeerRegistry::new(config.peer_ttl(), config.max_peers));
        Ok(Self {
            listener,
            registry,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    /// Cancelling the token stops the accept loop and the sweep task.
    /// Connections already accepted run to their natural end.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> std::io::Result<()> {
        let Self {
            listener,
            registry,
            config,
            shutdown,
        } = self;
        info!(addr = %listener.local_addr()?, "registry listening");

        let sweep_registry = registry.clone();
        let sweep_shutdown = shutdown.clone();
        let period = config.cleanup_interval();
        let sweep = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweep_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = sweep_registry.cleanup_timeout_peers();
                        debug!(removed, online = sweep_registry.peer_count(), "ttl sweep");
                    }
                }
            }
        });

        let idle_timeout = config.peer_ttl();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        debug!(%peer, "client connected");
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, &registry, peer, idle_timeout, READ_WRITE_TIMEOUT).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        sweep.abort();
        info!("registry server stopped");
        Ok(())
    }
}
