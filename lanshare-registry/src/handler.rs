//! Per-connection message loop: one request in, at most one response out.

use std::net::SocketAddr;
use std::time::Duration;

use lanshare_core::wire::{receive_message, send_message, WireError};
use lanshare_core::{Body, Message};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::registry::PeerRegistry;

/// Serve one client until it disconnects, goes idle past `idle_timeout`, or breaks the protocol.
pub async fn handle_connection<S>(
    mut stream: S,
    registry: &PeerRegistry,
    peer: SocketAddr,
    idle_timeout: Duration,
    io_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = match receive_message(&mut stream, idle_timeout).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(%peer, "client disconnected");
                break;
            }
            Err(WireError::Timeout) => {
                debug!(%peer, "client idle, closing");
                break;
            }
            Err(e) => {
                warn!(%peer, error = %e, "dropping connection");
                break;
            }
        };
        debug!(%peer, kind = %msg.kind(), "received message");
        if let Some(response) = handle_message(registry, msg) {
            if let Err(e) = send_message(&mut stream, &response, io_timeout).await {
                warn!(%peer, error = %e, "failed to send response");
                break;
            }
        }
    }
}

/// Dispatch one message against the registry. Only `Register` and `QueryPeers` produce a response.
pub fn handle_message(registry: &PeerRegistry, msg: Message) -> Option<Message> {
    match msg.body {
        Body::Register { peer_info } => {
            let label = peer_info.to_string();
            match registry.register_peer(peer_info) {
                Ok(peer_id) => {
                    info!(peer = %label, "register ok");
                    Some(Message::register_ack(peer_id))
                }
                Err(e) => {
                    info!(peer = %label, reason = %e, "register refused");
                    Some(Message::register_nack(e.to_string()))
                }
            }
        }
        Body::QueryPeers { file_name_filter } => {
            let filter = file_name_filter
                .as_deref()
                .map(str::trim)
                .filter(|f| !f.is_empty());
            let peers = match filter {
                Some(name) => registry.get_peers_with_file(name),
                None => registry.get_all_peers(),
            };
            info!(count = peers.len(), filter = filter.unwrap_or(""), "query");
            Some(Message::query_response(peers))
        }
        Body::Deregister { peer_id } => {
            match registry.find_username_by_peer_id(&peer_id) {
                Some(username) => {
                    registry.deregister_peer(&username);
                }
                None => info!(%peer_id, "deregister for unknown or expired peer"),
            }
            None
        }
        Body::Heartbeat { peer_id } => {
            match registry.find_username_by_peer_id(&peer_id) {
                Some(username) => {
                    registry.update_heartbeat(&username);
                    debug!(%username, "heartbeat");
                }
                None => debug!(%peer_id, "heartbeat for unknown or expired peer"),
            }
            None
        }
        other => {
            warn!(kind = %other.kind(), "unsupported message type");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_core::protocol::MAX_MESSAGE_LEN;
    use lanshare_core::PeerInfo;
    use tokio::io::AsyncWriteExt;

    const T: Duration = Duration::from_secs(5);

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Duration::from_secs(300), 2)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn register_then_query() {
        let reg = registry();
        let alice = PeerInfo::new("alice", "10.0.0.1", 5001);
        let resp = handle_message(&reg, Message::register(alice.clone())).unwrap();
        assert_eq!(
            resp.body,
            Body::RegisterAck {
                peer_id: alice.peer_id.clone()
            }
        );
        let resp = handle_message(&reg, Message::query_peers(None)).unwrap();
        match resp.body {
            Body::QueryResponse { peers } => assert_eq!(peers[0].username, "alice"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn capacity_scenario() {
        let reg = registry();
        for name in ["alice", "bob"] {
            let resp = handle_message(&reg, Message::register(PeerInfo::new(name, "10.0.0.1", 1)));
            assert!(matches!(resp.unwrap().body, Body::RegisterAck { .. }));
        }
        let resp = handle_message(&reg, Message::register(PeerInfo::new("carol", "10.0.0.3", 1)));
        match resp.unwrap().body {
            Body::RegisterNack { reason } => assert!(reason.contains("limit")),
            other => panic!("unexpected {:?}", other),
        }
        let resp = handle_message(&reg, Message::register(PeerInfo::new("alice", "10.0.0.1", 7)));
        assert!(matches!(resp.unwrap().body, Body::RegisterAck { .. }));
        assert_eq!(reg.get_all_peers().len(), 2);

        reg.backdate("bob", Duration::from_secs(301));
        let names: Vec<_> = reg.get_all_peers().into_iter().map(|p| p.username).collect();
        assert_eq!(names, vec!["alice"]);
    }

    #[test]
    fn deregister_and_heartbeat_resolve_peer_id() {
        let reg = registry();
        let alice = PeerInfo::new("alice", "10.0.0.1", 5001);
        handle_message(&reg, Message::register(alice.clone()));
        reg.backdate("alice", Duration::from_secs(200));
        assert!(handle_message(&reg, Message::heartbeat(alice.peer_id.clone())).is_none());
        reg.backdate("alice", Duration::from_secs(200));
        assert_eq!(reg.get_all_peers().len(), 1);

        assert!(handle_message(&reg, Message::deregister("unknown")).is_none());
        assert_eq!(reg.peer_count(), 1);
        assert!(handle_message(&reg, Message::deregister(alice.peer_id)).is_none());
        assert_eq!(reg.peer_count(), 0);
    }

    #[test]
    fn blank_filter_means_all() {
        let reg = registry();
        handle_message(&reg, Message::register(PeerInfo::new("a", "10.0.0.1", 1)));
        let resp = handle_message(&reg, Message::query_peers(Some("  ".into()))).unwrap();
        assert!(matches!(resp.body, Body::QueryResponse { peers } if peers.len() == 1));
    }

    #[test]
    fn server_bound_messages_are_ignored() {
        let reg = registry();
        assert!(handle_message(&reg, Message::register_ack("x")).is_none());
        assert!(handle_message(&reg, Message::transfer_request("f", 1, "")).is_none());
    }

    #[tokio::test]
    async fn connection_serves_sequential_requests() {
        let reg = registry();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let serve = handle_connection(server, &reg, addr(), T, T);
        let drive = async {
            let alice = PeerInfo::new("alice", "10.0.0.1", 5001);
            send_message(&mut client, &Message::register(alice), T).await.unwrap();
            let ack = receive_message(&mut client, T).await.unwrap().unwrap();
            assert!(matches!(ack.body, Body::RegisterAck { .. }));

            send_message(&mut client, &Message::heartbeat("nope"), T).await.unwrap();
            send_message(&mut client, &Message::query_peers(None), T).await.unwrap();
            let resp = receive_message(&mut client, T).await.unwrap().unwrap();
            assert!(matches!(resp.body, Body::QueryResponse { peers } if peers.len() == 1));
            drop(client);
        };
        tokio::join!(serve, drive);
    }

    #[tokio::test]
    async fn out_of_range_port_is_nacked_and_connection_stays_open() {
        let reg = registry();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let serve = handle_connection(server, &reg, addr(), T, T);
        let drive = async {
            let raw = br#"{"type":"Register","data":{"peerInfo":{"peerId":"p1","username":"dave","ipAddress":"10.0.0.9","listenPort":70000}}}"#;
            client.write_all(&(raw.len() as u32).to_le_bytes()).await.unwrap();
            client.write_all(raw).await.unwrap();
            let resp = receive_message(&mut client, T).await.unwrap().unwrap();
            match resp.body {
                Body::RegisterNack { reason } => assert!(reason.contains("70000")),
                other => panic!("unexpected {:?}", other),
            }

            send_message(&mut client, &Message::query_peers(None), T).await.unwrap();
            let resp = receive_message(&mut client, T).await.unwrap().unwrap();
            assert!(matches!(resp.body, Body::QueryResponse { peers } if peers.is_empty()));
            drop(client);
        };
        tokio::join!(serve, drive);
        assert_eq!(reg.peer_count(), 0);
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection_without_panic() {
        let reg = registry();
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(&(MAX_MESSAGE_LEN + 1).to_le_bytes())
            .await
            .unwrap();
        handle_connection(server, &reg, addr(), T, T).await;
        assert_eq!(reg.peer_count(), 0);
    }

    #[tokio::test]
    async fn garbage_payload_ends_loop() {
        let reg = registry();
        let (mut client, server) = tokio::io::duplex(1024);
        let junk = b"{not json";
        client.write_all(&(junk.len() as u32).to_le_bytes()).await.unwrap();
        client.write_all(junk).await.unwrap();
        handle_connection(server, &reg, addr(), T, T).await;
    }

    #[tokio::test]
    async fn idle_client_is_closed() {
        let reg = registry();
        let (_client, server) = tokio::io::duplex(1024);
        handle_connection(server, &reg, addr(), Duration::from_millis(50), T).await;
    }
}
