//! In-memory peer directory keyed by username, with heartbeat TTL.
//!
//! Keys are lowercased usernames, so names are unique ignoring case; the stored
//! `PeerInfo` keeps the casing of the most recent registration. Every operation is a
//! single map transaction, safe to call from any number of connection tasks.

use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lanshare_core::model::new_peer_id;
use lanshare_core::net::is_valid_ip;
use lanshare_core::{PeerInfo, PeerRegistration};
use tracing::{debug, info};

/// Why a registration was refused. The message is sent back in `RegisterNack`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("invalid IP address: {0:?}")]
    InvalidAddress(String),
    #[error("invalid listen port: {0}")]
    InvalidPort(i64),
    #[error("server reached its limit of {0} peers")]
    Full(usize),
}

pub struct PeerRegistry {
    peers: DashMap<String, PeerInfo>,
    ttl: Duration,
    max_peers: usize,
}

fn key(username: &str) -> String {
    username.trim().to_lowercase()
}

impl PeerRegistry {
    pub fn new(ttl: Duration, max_peers: usize) -> Self {
        Self {
            peers: DashMap::new(),
            ttl,
            max_peers,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh a peer. Returns the stored peer ID: an existing entry keeps its
    /// ID, a new one takes the ID supplied (or a fresh one if blank).
    ///
    /// New usernames are refused once `max_peers` entries are held (after reclaiming
    /// expired ones); re-registration of a known username is never capped.
    pub fn register_peer(&self, info: impl Into<PeerRegistration>) -> Result<String, RegistrationError> {
        let info = info.into();
        let username = info.username.trim().to_owned();
        if username.is_empty() {
            return Err(RegistrationError::EmptyUsername);
        }
        if !is_valid_ip(&info.ip_address) {
            return Err(RegistrationError::InvalidAddress(info.ip_address));
        }
        let mut info = info
            .into_peer_info()
            .map_err(RegistrationError::InvalidPort)?;
        let k = key(&username);
        if !self.peers.contains_key(&k) && self.peers.len() >= self.max_peers {
            self.cleanup_timeout_peers();
            if self.peers.len() >= self.max_peers {
                return Err(RegistrationError::Full(self.max_peers));
            }
        }

        info.username = username;
        info.ip_address = info.ip_address.trim().to_owned();
        info.last_seen = Utc::now();
        if info.peer_id.trim().is_empty() {
            info.peer_id = new_peer_id();
        }

        let peer_id = match self.peers.entry(k) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().peer_id.clone();
                info.peer_id = existing.clone();
                debug!(peer = %info, "registration refreshed");
                entry.insert(info);
                existing
            }
            Entry::Vacant(entry) => {
                let id = info.peer_id.clone();
                info!(peer = %info, "peer registered");
                entry.insert(info);
                id
            }
        };
        Ok(peer_id)
    }

    /// Remove a peer by username. Returns whether an entry existed.
    pub fn deregister_peer(&self, username: &str) -> bool {
        let removed = self.peers.remove(&key(username));
        if let Some((_, peer)) = &removed {
            info!(peer = %peer, "peer deregistered");
        }
        removed.is_some()
    }

    /// Online peers sorted by username (ignoring case).
    pub fn get_all_peers(&self) -> Vec<PeerInfo> {
        self.online_where(|_| true)
    }

    /// Online peers sharing a file with this name (ignoring case).
    pub fn get_peers_with_file(&self, file_name: &str) -> Vec<PeerInfo> {
        self.online_where(|p| p.shares_file(file_name))
    }

    fn online_where<F>(&self, keep: F) -> Vec<PeerInfo>
    where
        F: Fn(&PeerInfo) -> bool,
    {
        let now = Utc::now();
        let mut out: Vec<PeerInfo> = self
            .peers
            .iter()
            .filter(|e| e.value().is_online_at(self.ttl, now) && keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_cached_key(|p| p.username.to_lowercase());
        out
    }

    /// Refresh `last_seen`. Unknown usernames are ignored. Returns whether one was found.
    pub fn update_heartbeat(&self, username: &str) -> bool {
        match self.peers.get_mut(&key(username)) {
            Some(mut peer) => {
                peer.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Drop every entry older than the TTL. Returns how many were removed.
    pub fn cleanup_timeout_peers(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.peers.retain(|_, peer| {
            let keep = peer.is_online_at(self.ttl, now);
            if !keep {
                info!(peer = %peer, "peer timed out");
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Username of the online peer holding `peer_id`.
    ///
    /// Linear in the number of peers; fine at LAN scale.
    pub fn find_username_by_peer_id(&self, peer_id: &str) -> Option<String> {
        if peer_id.trim().is_empty() {
            return None;
        }
        let now = Utc::now();
        self.peers
            .iter()
            .find(|e| e.value().peer_id == peer_id && e.value().is_online_at(self.ttl, now))
            .map(|e| e.value().username.clone())
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, username: &str, by: Duration) {
        if let Some(mut peer) = self.peers.get_mut(&key(username)) {
            peer.last_seen = peer.last_seen - chrono::TimeDelta::from_std(by).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(300);

    fn peer(name: &str, port: u16) -> PeerInfo {
        PeerInfo::new(name, "192.168.1.20", port)
    }

    #[test]
    fn register_and_list_sorted() {
        let reg = PeerRegistry::new(TTL, 10);
        reg.register_peer(peer("carol", 1)).unwrap();
        reg.register_peer(peer("Alice", 2)).unwrap();
        reg.register_peer(peer("bob", 3)).unwrap();
        let names: Vec<_> = reg.get_all_peers().into_iter().map(|p| p.username).collect();
        assert_eq!(names, vec!["Alice", "bob", "carol"]);
    }

    #[test]
    fn validation_has_no_side_effects() {
        let reg = PeerRegistry::new(TTL, 10);
        assert_eq!(
            reg.register_peer(peer("  ", 1)),
            Err(RegistrationError::EmptyUsername)
        );
        let mut bad = peer("dave", 1);
        bad.ip_address = "999.1.1.1".into();
        assert!(matches!(
            reg.register_peer(bad),
            Err(RegistrationError::InvalidAddress(_))
        ));
        let mut host = peer("erin", 1);
        host.ip_address = "erin.local".into();
        assert!(reg.register_peer(host).is_err());
        assert_eq!(reg.peer_count(), 0);
    }

    #[test]
    fn ipv6_literal_accepted() {
        let reg = PeerRegistry::new(TTL, 10);
        let mut p = peer("v6", 1);
        p.ip_address = "fe80::1".into();
        assert!(reg.register_peer(p).is_ok());
    }

    #[test]
    fn out_of_range_port_refused() {
        let reg = PeerRegistry::new(TTL, 10);
        for port in [70000, -1] {
            let mut p = PeerRegistration::from(peer("frank", 1));
            p.listen_port = port;
            assert_eq!(reg.register_peer(p), Err(RegistrationError::InvalidPort(port)));
        }
        assert_eq!(reg.peer_count(), 0);
        assert!(reg.register_peer(peer("frank", 65535)).is_ok());
    }

    #[test]
    fn reregistration_updates_port_and_keeps_peer_id() {
        let reg = PeerRegistry::new(TTL, 10);
        let first = peer("alice", 5001);
        let id = reg.register_peer(first.clone()).unwrap();
        assert_eq!(id, first.peer_id);

        let second = peer("ALICE", 6001);
        assert_ne!(second.peer_id, first.peer_id);
        let id2 = reg.register_peer(second).unwrap();
        assert_eq!(id2, first.peer_id);

        let all = reg.get_all_peers();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].listen_port, 6001);
        assert_eq!(all[0].username, "ALICE");
        assert_eq!(all[0].peer_id, first.peer_id);
    }

    #[test]
    fn blank_peer_id_gets_minted() {
        let reg = PeerRegistry::new(TTL, 10);
        let mut p = peer("frank", 1);
        p.peer_id.clear();
        let id = reg.register_peer(p).unwrap();
        assert!(!id.is_empty());
    }

    #[test]
    fn cap_blocks_new_names_only() {
        let reg = PeerRegistry::new(TTL, 2);
        reg.register_peer(peer("alice", 1)).unwrap();
        reg.register_peer(peer("bob", 2)).unwrap();
        assert_eq!(
            reg.register_peer(peer("carol", 3)),
            Err(RegistrationError::Full(2))
        );
        assert!(reg.register_peer(peer("alice", 9)).is_ok());
        assert_eq!(reg.get_all_peers().len(), 2);
    }

    #[test]
    fn cap_reclaims_expired_entries() {
        let reg = PeerRegistry::new(TTL, 1);
        reg.register_peer(peer("old", 1)).unwrap();
        reg.backdate("old", TTL + Duration::from_secs(1));
        assert!(reg.register_peer(peer("new", 2)).is_ok());
        let names: Vec<_> = reg.get_all_peers().into_iter().map(|p| p.username).collect();
        assert_eq!(names, vec!["new"]);
    }

    #[test]
    fn expired_peers_hidden_before_sweep() {
        let reg = PeerRegistry::new(TTL, 10);
        reg.register_peer(peer("alice", 1)).unwrap();
        reg.register_peer(peer("bob", 2)).unwrap();
        reg.backdate("bob", TTL + Duration::from_secs(1));

        let names: Vec<_> = reg.get_all_peers().into_iter().map(|p| p.username).collect();
        assert_eq!(names, vec!["alice"]);
        assert_eq!(reg.peer_count(), 2);

        assert_eq!(reg.cleanup_timeout_peers(), 1);
        assert_eq!(reg.peer_count(), 1);
        assert_eq!(reg.cleanup_timeout_peers(), 0);
    }

    #[test]
    fn heartbeat_revives_aging_peer() {
        let reg = PeerRegistry::new(TTL, 10);
        reg.register_peer(peer("bob", 2)).unwrap();
        reg.backdate("bob", TTL - Duration::from_secs(1));
        assert!(reg.update_heartbeat("Bob"));
        reg.backdate("bob", Duration::from_secs(2));
        assert_eq!(reg.get_all_peers().len(), 1);
        assert!(!reg.update_heartbeat("nobody"));
    }

    #[test]
    fn heartbeat_keeps_other_fields() {
        let reg = PeerRegistry::new(TTL, 10);
        let p = peer("gina", 7000);
        reg.register_peer(p.clone()).unwrap();
        reg.update_heartbeat("gina");
        let stored = &reg.get_all_peers()[0];
        assert_eq!(stored.listen_port, 7000);
        assert_eq!(stored.peer_id, p.peer_id);
    }

    #[test]
    fn file_query_ignores_case_and_ttl() {
        let reg = PeerRegistry::new(TTL, 10);
        let mut a = peer("alice", 1);
        a.shared_files.push(lanshare_core::SharedFile {
            file_name: "Notes.TXT".into(),
            file_size: 3,
            file_path: Default::default(),
            checksum: String::new(),
            checksum_algorithm: Default::default(),
        });
        let mut b = a.clone();
        b.username = "bob".into();
        b.peer_id = new_peer_id();
        reg.register_peer(a).unwrap();
        reg.register_peer(b).unwrap();
        reg.register_peer(peer("carol", 3)).unwrap();
        reg.backdate("bob", TTL * 2);

        let hits: Vec<_> = reg
            .get_peers_with_file("notes.txt")
            .into_iter()
            .map(|p| p.username)
            .collect();
        assert_eq!(hits, vec!["alice"]);
        assert!(reg.get_peers_with_file("missing.bin").is_empty());
    }

    #[test]
    fn deregister_reports_existence() {
        let reg = PeerRegistry::new(TTL, 10);
        reg.register_peer(peer("alice", 1)).unwrap();
        assert!(reg.deregister_peer("ALICE"));
        assert!(!reg.deregister_peer("alice"));
    }

    #[test]
    fn peer_id_lookup_only_sees_online() {
        let reg = PeerRegistry::new(TTL, 10);
        let p = peer("hal", 1);
        let id = reg.register_peer(p).unwrap();
        assert_eq!(reg.find_username_by_peer_id(&id).as_deref(), Some("hal"));
        reg.backdate("hal", TTL * 2);
        assert_eq!(reg.find_username_by_peer_id(&id), None);
        assert_eq!(reg.find_username_by_peer_id(""), None);
    }

    #[test]
    fn ttl_elapses_in_real_time() {
        let reg = PeerRegistry::new(Duration::from_millis(150), 2);
        reg.register_peer(peer("alice", 1)).unwrap();
        reg.register_peer(peer("bob", 2)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        reg.update_heartbeat("alice");
        std::thread::sleep(Duration::from_millis(100));
        let names: Vec<_> = reg.get_all_peers().into_iter().map(|p| p.username).collect();
        assert_eq!(names, vec!["alice"]);
    }

    #[test]
    fn concurrent_writers_do_not_lose_entries() {
        let reg = Arc::new(PeerRegistry::new(TTL, 10_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let name = format!("peer-{}-{}", t, i);
                        reg.register_peer(peer(&name, i as u16)).unwrap();
                        reg.update_heartbeat(&name);
                        if i % 3 == 0 {
                            reg.cleanup_timeout_peers();
                        }
                        if i % 5 == 0 {
                            reg.deregister_peer(&name);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.get_all_peers().len(), 8 * 160);
    }

    #[test]
    fn concurrent_same_key_keeps_one_entry() {
        let reg = Arc::new(PeerRegistry::new(TTL, 10));
        let handles: Vec<_> = (0..8u16)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        reg.register_peer(peer("shared", 1000 + t)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.peer_count(), 1);
    }
}
