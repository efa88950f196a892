//! Data model shared by registry and peers: peer descriptors and shared files.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;

/// Mint a fresh opaque peer ID.
pub fn new_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Identity record for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Stable for a session; reissued on rename.
    #[serde(default)]
    pub peer_id: String,
    /// Registry key, unique ignoring case.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub ip_address: String,
    /// File-transfer TCP port.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub shared_files: Vec<SharedFile>,
}

impl PeerInfo {
    pub fn new(username: impl Into<String>, ip_address: impl Into<String>, listen_port: u16) -> Self {
        Self {
            peer_id: new_peer_id(),
            username: username.into(),
            ip_address: ip_address.into(),
            listen_port,
            last_seen: Utc::now(),
            shared_files: Vec::new(),
        }
    }

    /// Online iff `now - last_seen <= ttl`. A `last_seen` in the future counts as online.
    pub fn is_online_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.last_seen) <= ttl
    }

    pub fn is_online(&self, ttl: Duration) -> bool {
        self.is_online_at(ttl, Utc::now())
    }

    /// Transfer endpoint, if `ip_address` parses.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ip_address.trim().parse().ok()?;
        Some(SocketAddr::new(ip, self.listen_port))
    }

    /// True if any shared file has this name, ignoring case.
    pub fn shares_file(&self, file_name: &str) -> bool {
        let wanted = file_name.to_lowercase();
        self.shared_files
            .iter()
            .any(|f| f.file_name.to_lowercase() == wanted)
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.username, self.ip_address, self.listen_port)
    }
}

/// A `PeerInfo` as submitted in a `Register`. The port is carried wide so an out-of-range
/// value reaches registry validation instead of failing the decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRegistration {
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub listen_port: i64,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub shared_files: Vec<SharedFile>,
}

impl PeerRegistration {
    /// The descriptor with a checked port; `Err` carries the raw value when it is not a TCP port.
    pub fn into_peer_info(self) -> Result<PeerInfo, i64> {
        let listen_port = u16::try_from(self.listen_port).map_err(|_| self.listen_port)?;
        Ok(PeerInfo {
            peer_id: self.peer_id,
            username: self.username,
            ip_address: self.ip_address,
            listen_port,
            last_seen: self.last_seen,
            shared_files: self.shared_files,
        })
    }
}

impl From<PeerInfo> for PeerRegistration {
    fn from(info: PeerInfo) -> Self {
        Self {
            peer_id: info.peer_id,
            username: info.username,
            ip_address: info.ip_address,
            listen_port: i64::from(info.listen_port),
            last_seen: info.last_seen,
            shared_files: info.shared_files,
        }
    }
}

impl fmt::Display for PeerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.username, self.ip_address, self.listen_port)
    }
}

/// A file advertised by a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    pub file_name: String,
    pub file_size: u64,
    /// Local to the sharing peer; never put on the wire.
    #[serde(default, skip_serializing)]
    pub file_path: PathBuf,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl fmt::Display for SharedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.file_name, format_file_size(self.file_size))
    }
}

/// Human-readable size: `1.5 KB`, `3 MB`, ...
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut len = bytes as f64;
    let mut order = 0;
    while len >= 1024.0 && order < UNITS.len() - 1 {
        order += 1;
        len /= 1024.0;
    }
    let text = format!("{:.2}", len);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", text, UNITS[order])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_boundary_is_inclusive() {
        let mut peer = PeerInfo::new("bob", "10.0.0.2", 5001);
        let now = Utc::now();
        peer.last_seen = now - TimeDelta::seconds(10);
        assert!(peer.is_online_at(Duration::from_secs(10), now));
        assert!(!peer.is_online_at(Duration::from_secs(9), now));
    }

    #[test]
    fn future_last_seen_is_online() {
        let mut peer = PeerInfo::new("bob", "10.0.0.2", 5001);
        peer.last_seen = Utc::now() + TimeDelta::seconds(30);
        assert!(peer.is_online(Duration::from_secs(1)));
    }

    #[test]
    fn shares_file_ignores_case() {
        let mut peer = PeerInfo::new("carol", "10.0.0.3", 5001);
        peer.shared_files.push(SharedFile {
            file_name: "Report.PDF".into(),
            file_size: 10,
            file_path: PathBuf::new(),
            checksum: String::new(),
            checksum_algorithm: ChecksumAlgorithm::Sha256,
        });
        assert!(peer.shares_file("report.pdf"));
        assert!(!peer.shares_file("report"));
    }

    #[test]
    fn file_path_stays_local() {
        let file = SharedFile {
            file_name: "a.txt".into(),
            file_size: 1,
            file_path: PathBuf::from("/home/me/secret/a.txt"),
            checksum: "00".into(),
            checksum_algorithm: ChecksumAlgorithm::Md5,
        };
        let json = serde_json::to_string(&file).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains(r#""checksumAlgorithm":"MD5""#));
    }

    #[test]
    fn endpoint_parses_ipv4_and_ipv6() {
        let v4 = PeerInfo::new("a", "192.168.0.7", 6000);
        assert_eq!(v4.endpoint(), Some("192.168.0.7:6000".parse().unwrap()));
        let v6 = PeerInfo::new("b", "::1", 6001);
        assert_eq!(v6.endpoint(), Some("[::1]:6001".parse().unwrap()));
        assert_eq!(PeerInfo::new("c", "", 1).endpoint(), None);
    }

    #[test]
    fn registration_port_is_range_checked() {
        let raw = br#"{"peerId":"p1","username":"dave","ipAddress":"10.0.0.9","listenPort":70000}"#;
        let reg: PeerRegistration = serde_json::from_slice(raw).unwrap();
        assert_eq!(reg.clone().into_peer_info(), Err(70000));

        let raw = br#"{"username":"dave","ipAddress":"10.0.0.9","listenPort":-1}"#;
        let reg: PeerRegistration = serde_json::from_slice(raw).unwrap();
        assert_eq!(reg.into_peer_info(), Err(-1));

        let info = PeerInfo::new("erin", "10.0.0.4", 65535);
        let back = PeerRegistration::from(info.clone()).into_peer_info().unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn sizes_format() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(10 * 1024 * 1024), "10 MB");
    }
}
