//! Streaming artifact checksums

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::errors::AgentError;
use crate::utils::hex;

/// Files are hashed in fixed chunks so artifacts never sit in memory whole
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Md5,
    Sha256,
}

impl Algorithm {
    pub fn prefix(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Md5 => "md5",
            Algorithm::Sha256 => "sha256",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha1 => 40,
            Algorithm::Md5 => 32,
            Algorithm::Sha256 => 64,
        }
    }
}

/// An expected digest, written `sha1:<hex>`, `md5:<hex>`, `sha256:<hex>` or as
/// bare hex whose length picks the algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: Algorithm,
    pub hex: String,
}

impl FromStr for Checksum {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (algorithm, digest) = match s.split_once(':') {
            Some((prefix, digest)) => {
                let algorithm = match prefix.to_ascii_lowercase().as_str() {
                    "sha1" => Algorithm::Sha1,
                    "md5" => Algorithm::Md5,
                    "sha256" => Algorithm::Sha256,
                    other => {
                        return Err(AgentError::ConfigError(format!(
                            "unsupported checksum algorithm '{}'",
                            other
                        )))
                    }
                };
                (algorithm, digest)
            }
            None => {
                let algorithm = match s.len() {
                    40 => Algorithm::Sha1,
                    32 => Algorithm::Md5,
                    64 => Algorithm::Sha256,
                    _ => {
                        return Err(AgentError::ConfigError(format!(
                            "cannot infer checksum algorithm from '{}'",
                            s
                        )))
                    }
                };
                (algorithm, s)
            }
        };
        if digest.len() != algorithm.hex_len() || !hex::is_hex(digest) {
            return Err(AgentError::ConfigError(format!(
                "malformed {} checksum '{}'",
                algorithm.prefix(),
                digest
            )));
        }
        Ok(Checksum {
            algorithm,
            hex: digest.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.prefix(), self.hex)
    }
}

/// Hash a file with the given algorithm
pub async fn compute(path: &Path, algorithm: Algorithm) -> Result<String, AgentError> {
    match algorithm {
        Algorithm::Sha1 => digest_file::<Sha1>(path).await,
        Algorithm::Md5 => digest_file::<Md5>(path).await,
        Algorithm::Sha256 => digest_file::<Sha256>(path).await,
    }
}

async fn digest_file<D: Digest>(path: &Path) -> Result<String, AgentError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fail with a checksum mismatch unless the file hashes to `expected`
pub async fn verify(path: &Path, expected: &Checksum) -> Result<(), AgentError> {
    let actual = compute(path, expected.algorithm).await?;
    if actual != expected.hex {
        return Err(AgentError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: format!("{}:{}", expected.algorithm.prefix(), actual),
        });
    }
    Ok(())
}

/// Whether the file exists and hashes to `expected`
pub async fn is_match(path: &Path, expected: &Checksum) -> bool {
    verify(path, expected).await.is_ok()
}
