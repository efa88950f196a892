//! Load peer config: defaults, then config file (if present), then environment.

use std::path::{Path, PathBuf};

use lanshare_core::ClientConfig;

/// File: ~/.config/lanshare/peer.toml or /etc/lanshare/peer.toml.
/// Env overrides: LANSHARE_SERVER_ADDR, LANSHARE_SERVER_PORT, LANSHARE_LISTEN_PORT,
/// LANSHARE_DISCOVERY_PORT, LANSHARE_USERNAME.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let mut c = match explicit {
        Some(path) => load_path(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut ClientConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LANSHARE_SERVER_ADDR") {
        c.server_address = s;
    }
    if let Some(p) = var("LANSHARE_SERVER_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.server_port = p;
    }
    if let Some(p) = var("LANSHARE_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(p) = var("LANSHARE_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(name) = var("LANSHARE_USERNAME").filter(|s| !s.trim().is_empty()) {
        c.username = name;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/lanshare/peer.toml"));
    }
    out.push(PathBuf::from("/etc/lanshare/peer.toml"));
    out
}

fn load_path(path: &Path) -> anyhow::Result<ClientConfig> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    toml::from_str(&s).map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))
}

fn load_file() -> Option<ClientConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match load_path(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring config file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_document_with_env_on_top() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.toml");
        std::fs::write(
            &path,
            "server_address = \"192.168.1.10\"\nusername = \"alice\"\nkeep_mismatched_files = false\n",
        )
        .unwrap();
        let mut c = load_path(&path).unwrap();
        assert_eq!(c.server_address, "192.168.1.10");
        assert!(!c.keep_mismatched_files);

        apply_env(&mut c, |k| match k {
            "LANSHARE_USERNAME" => Some("  ".into()),
            "LANSHARE_LISTEN_PORT" => Some("6001".into()),
            "LANSHARE_SERVER_PORT" => Some("99999".into()),
            _ => None,
        });
        assert_eq!(c.username, "alice");
        assert_eq!(c.listen_port, 6001);
        assert_eq!(c.server_port, lanshare_core::protocol::DEFAULT_SERVER_PORT);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.toml");
        std::fs::write(&path, "proxy_port = 3128\n").unwrap();
        assert!(load_path(&path).is_err());
    }
}
