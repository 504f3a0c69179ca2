use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{DownloadError, Result};

/// Hex-encoded SHA-256 of a file.
pub async fn calculate_hash(filepath: &Path) -> Result<String> {
    let mut file = File::open(filepath).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare a finished download against an expected hex digest (case-insensitive).
pub async fn verify_sha256(filepath: &Path, expected: &str) -> Result<()> {
    let actual = calculate_hash(filepath).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(DownloadError::ChecksumMismatch {
            expected: expected.trim().to_lowercase(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn test_calculate_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        assert_eq!(calculate_hash(&path).await.unwrap(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn test_verify_sha256() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        verify_sha256(&path, &HELLO_SHA256.to_uppercase()).await.unwrap();

        let err = verify_sha256(&path, "deadbeef").await.unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
    }
}
