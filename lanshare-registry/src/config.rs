//! Load registry config: defaults, then config file (if present), then environment.

use std::path::{Path, PathBuf};

use lanshare_core::ServerConfig;

/// File: ~/.config/lanshare/registry.toml or /etc/lanshare/registry.toml.
/// Env overrides: LANSHARE_SERVER_PORT, LANSHARE_MAX_PEERS, LANSHARE_PEER_TTL_SECS.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<ServerConfig> {
    let mut c = match explicit {
        Some(path) => load_path(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut ServerConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("LANSHARE_SERVER_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.port = p;
    }
    if let Some(n) = var("LANSHARE_MAX_PEERS").and_then(|s| s.parse::<usize>().ok()) {
        c.max_peers = n;
    }
    if let Some(n) = var("LANSHARE_PEER_TTL_SECS").and_then(|s| s.parse::<u64>().ok()) {
        c.peer_timeout_secs = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/lanshare/registry.toml"));
    }
    out.push(PathBuf::from("/etc/lanshare/registry.toml"));
    out
}

fn load_path(path: &Path) -> anyhow::Result<ServerConfig> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    toml::from_str(&s).map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))
}

/// First existing path wins; a broken file falls back to defaults with a warning.
fn load_file() -> Option<ServerConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match load_path(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring config file");
            None
        }
    }
}
