//! Integrity: streaming file checksums (SHA-256 default, MD5), hex-encoded.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Supported checksum algorithms; serialized as `"SHA256"` / `"MD5"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    #[default]
    #[serde(rename = "SHA256", alias = "sha256")]
    Sha256,
    #[serde(rename = "MD5", alias = "md5")]
    Md5,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "SHA256",
            ChecksumAlgorithm::Md5 => "MD5",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SHA256" | "SHA-256" => Ok(ChecksumAlgorithm::Sha256),
            "MD5" => Ok(ChecksumAlgorithm::Md5),
            other => Err(ChecksumError::UnsupportedAlgorithm(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

enum Hasher {
    Sha256(Sha256),
    Md5(Md5),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Md5 => Hasher::Md5(Md5::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash an in-memory buffer. Lowercase hex.
pub fn hash_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Stream a file through the hasher without loading it whole. Lowercase hex.
pub async fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, ChecksumError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ChecksumError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

pub async fn sha256_file(path: &Path) -> Result<String, ChecksumError> {
    hash_file(path, ChecksumAlgorithm::Sha256).await
}

pub async fn md5_file(path: &Path) -> Result<String, ChecksumError> {
    hash_file(path, ChecksumAlgorithm::Md5).await
}

/// Hex digests compare ignoring case and surrounding whitespace.
pub fn checksums_match(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}

/// Recompute the file digest and compare it with `expected`.
pub async fn verify_file(
    path: &Path,
    expected: &str,
    algorithm: ChecksumAlgorithm,
) -> Result<bool, ChecksumError> {
    let actual = hash_file(path, algorithm).await?;
    Ok(checksums_match(&actual, expected))
}
