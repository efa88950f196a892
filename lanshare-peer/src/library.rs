//! Shared-directory scan: what this peer advertises.

use std::path::Path;

use lanshare_core::checksum::sha256_file;
use lanshare_core::{ChecksumAlgorithm, SharedFile};
use tracing::{debug, warn};

/// Top-level regular files of `dir`, sorted by name, each with its SHA-256.
/// A missing directory yields an empty list; unreadable entries are skipped.
pub async fn scan_shared_files(dir: &Path) -> Vec<SharedFile> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "shared directory not readable");
            return Vec::new();
        }
    };
    let mut files = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "stopping shared scan early");
                break;
            }
        };
        let path = entry.path();
        let meta = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping shared file");
                continue;
            }
        };
        let checksum = match sha256_file(&path).await {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping shared file");
                continue;
            }
        };
        files.push(SharedFile {
            file_name: entry.file_name().to_string_lossy().into_owned(),
            file_size: meta.len(),
            file_path: path,
            checksum,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
        });
    }
    files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    files
}
