// keg-aio/src/checksum.rs
use std::path::Path;
use std::sync::Arc;

use keg_common::error::{KegError, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A well-formed SHA-256 digest: 64 hex characters.
pub fn is_valid_sha256(digest: &str) -> bool {
    digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
}

fn compare(subject: &str, expected: &str, actual: String) -> Result<()> {
    debug!("Expected SHA256:   {}", expected);
    if is_valid_sha256(expected) && actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(KegError::ChecksumMismatch {
            subject: subject.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Accepts `bytes` only if their digest equals `expected` (case-insensitive).
/// A malformed expected digest never matches.
pub fn verify_bytes(bytes: &[u8], expected: &str, subject: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    debug!("Calculated SHA256: {} ({} bytes)", actual, bytes.len());
    compare(subject, expected, actual)
}

/// Streaming variant of [`verify_bytes`] for files on disk.
pub fn verify_checksum_sync(path: &Path, expected: &str, subject: &str) -> Result<()> {
    debug!("Sync Verifying checksum for: {}", path.display());
    let std_file = std::fs::File::open(path).map_err(|e| KegError::Io(Arc::new(e)))?;
    let mut std_reader = std::io::BufReader::new(std_file);
    let mut hasher = Sha256::new();
    let bytes_copied = std::io::copy(&mut std_reader, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    debug!("Sync Calculated SHA256: {} ({} bytes read)", actual, bytes_copied);
    compare(subject, expected, actual)
}

/// Asynchronously verifies the SHA-256 checksum of a file.
pub async fn verify_checksum_async(path: &Path, expected: &str, subject: &str) -> Result<()> {
    debug!("Async Verifying checksum for: {}", path.display());
    let mut file = File::open(path).await.map_err(|e| KegError::Io(Arc::new(e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = Vec::with_capacity(8192);
    let mut total_bytes_read = 0u64;
    loop {
        buffer.clear();
        let n = file
            .read_buf(&mut buffer)
            .await
            .map_err(|e| KegError::Io(Arc::new(e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total_bytes_read += n as u64;
    }

    let actual = hex::encode(hasher.finalize());
    debug!(
        "Async Calculated SHA256: {} ({} bytes read)",
        actual, total_bytes_read
    );
    compare(subject, expected, actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-formed digest of nothing in particular.
    const UNRELATED_SHA: &str = "c3b6a2b9d2a0ac3a3b8e1a2bb8b4a8b3f5dc1bc1f6e6a6c0d2a1b2e3f4a5b6c7";

    #[test]
    fn accepts_exact_digest_in_any_case() {
        let data = b"amqp-1.11.0 source";
        let digest = sha256_hex(data);
        assert!(verify_bytes(data, &digest, "amqp").is_ok());
        assert!(verify_bytes(data, &digest.to_uppercase(), "amqp").is_ok());
    }

    #[test]
    fn rejects_every_single_bit_flip() {
        let data = b"rabbitmq-c bottle".to_vec();
        let digest = sha256_hex(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut corrupted = data.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    matches!(
                        verify_bytes(&corrupted, &digest, "b"),
                        Err(KegError::ChecksumMismatch { .. })
                    ),
                    "flip of bit {bit} in byte {byte} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn malformed_expected_digest_is_a_mismatch() {
        let data = b"x";
        let digest = sha256_hex(data);
        assert!(verify_bytes(data, &digest[..63], "x").is_err());
        assert!(verify_bytes(data, "", "x").is_err());
        assert!(verify_bytes(data, UNRELATED_SHA, "x").is_err());
    }

    #[test]
    fn mismatch_reports_both_digests() {
        let err = verify_bytes(b"a", &sha256_hex(b"b"), "bottle of b").unwrap_err();
        match err {
            KegError::ChecksumMismatch {
                subject,
                expected,
                actual,
            } => {
                assert_eq!(subject, "bottle of b");
                assert_eq!(expected, sha256_hex(b"b"));
                assert_eq!(actual, sha256_hex(b"a"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn file_variants_agree_with_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.tar.gz");
        std::fs::write(&path, b"payload").unwrap();
        let digest = sha256_hex(b"payload");
        assert!(verify_checksum_sync(&path, &digest, "artifact").is_ok());
        assert!(verify_checksum_sync(&path, &sha256_hex(b"other"), "artifact").is_err());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        assert!(rt
            .block_on(verify_checksum_async(&path, &digest, "artifact"))
            .is_ok());
    }
}
