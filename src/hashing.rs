use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::MergeError;

pub async fn calculate_hash(filepath: &Path, cancel: &CancellationToken) -> Result<String, MergeError> {
    let mut file = File::open(filepath).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];

    loop {
        if cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

pub fn hashes_match(expected: &str, computed: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(computed)
}

/// Checks a finished file against the size and SHA-256 the caller expected, if any.
pub async fn verify_file(
    filepath: &Path,
    expected_size: Option<u64>,
    expected_sha256: Option<&str>,
    cancel: &CancellationToken,
) -> Result<(), MergeError> {
    if let Some(expected) = expected_size {
        let actual = tokio::fs::metadata(filepath).await?.len();
        if actual != expected {
            return Err(MergeError::SizeMismatch { expected, actual });
        }
    }
    if let Some(expected) = expected_sha256 {
        let actual = calculate_hash(filepath, cancel).await?;
        if !hashes_match(expected, &actual) {
            return Err(MergeError::HashMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}
