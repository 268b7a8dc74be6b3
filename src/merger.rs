use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::MergeError;
use crate::hashing::hashes_match;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeExpectations {
    /// Length announced by the origin.
    pub content_length: Option<u64>,
    /// Length the caller expects, if it knows better.
    pub expected_size: Option<u64>,
    pub expected_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeVerdict {
    Verified { bytes: u64, sha256: String },
}

/// Concatenates chunk files, in the order given, into the final file.
#[derive(Debug, Clone)]
pub struct ChunkMerger {
    buffer_size: usize,
}

impl ChunkMerger {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    pub async fn merge(
        &self,
        chunks: &[PathBuf],
        destination: &Path,
        expect: &MergeExpectations,
        cancel: &CancellationToken,
    ) -> Result<MergeVerdict, MergeError> {
        let mut total: u64 = 0;
        for chunk in chunks {
            total += fs::metadata(chunk).await?.len();
        }
        for expected in [expect.content_length, expect.expected_size].into_iter().flatten() {
            if total != expected {
                return Err(MergeError::SizeMismatch {
                    expected,
                    actual: total,
                });
            }
        }

        let (bytes, sha256) = self.concatenate(chunks, destination, cancel).await?;
        if bytes != total {
            // A chunk changed under us while copying.
            let _ = fs::remove_file(destination).await;
            return Err(MergeError::SizeMismatch {
                expected: total,
                actual: bytes,
            });
        }
        if let Some(expected) = &expect.expected_sha256 {
            if !hashes_match(expected, &sha256) {
                let _ = fs::remove_file(destination).await;
                return Err(MergeError::HashMismatch {
                    expected: expected.clone(),
                    actual: sha256,
                });
            }
        }

        debug!(destination = ?destination, chunks = chunks.len(), bytes, "chunks merged");
        Ok(MergeVerdict::Verified { bytes, sha256 })
    }

    /// Streams `chunks` into `destination`, truncating whatever was there before.
    /// Returns the byte count and SHA-256 of what was written. `cancel` is checked before
    /// every buffer; a cancelled merge leaves a partial `destination` behind.
    pub async fn concatenate(
        &self,
        chunks: &[PathBuf],
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(u64, String), MergeError> {
        let mut out = File::create(destination).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0; self.buffer_size];
        let mut written: u64 = 0;

        for chunk in chunks {
            let mut input = File::open(chunk).await?;
            loop {
                if cancel.is_cancelled() {
                    out.flush().await?;
                    return Err(MergeError::Cancelled);
                }
                let n = input.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buffer[..n]).await?;
                hasher.update(&buffer[..n]);
                written += n as u64;
            }
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok((written, hex::encode(hasher.finalize())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_chunks(dir: &Path, bodies: &[&[u8]]) -> Vec<PathBuf> {
        bodies
            .iter()
            .enumerate()
            .map(|(i, body)| {
                let path = dir.join(format!("slot.part{}", i));
                std::fs::write(&path, body).unwrap();
                path
            })
            .collect()
    }

    #[tokio::test]
    async fn merges_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_chunks(dir.path(), &[b"hello ", b"chunked ", b"world"]);
        let dest = dir.path().join("out");

        let verdict = ChunkMerger::new(4)
            .merge(
                &chunks,
                &dest,
                &MergeExpectations {
                    content_length: Some(19),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(verdict, MergeVerdict::Verified { bytes: 19, .. }));
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello chunked world");
    }

    #[tokio::test]
    async fn merging_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_chunks(dir.path(), &[&[1u8; 5000], &[2u8; 5000], &[3u8; 17]]);
        let dest = dir.path().join("out");
        let merger = ChunkMerger::new(1024);

        let cancel = CancellationToken::new();
        let first = merger.merge(&chunks, &dest, &MergeExpectations::default(), &cancel).await.unwrap();
        let first_bytes = std::fs::read(&dest).unwrap();
        let second = merger.merge(&chunks, &dest, &MergeExpectations::default(), &cancel).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&dest).unwrap(), first_bytes);
    }

    #[tokio::test]
    async fn rewrites_stale_destination() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_chunks(dir.path(), &[b"ab", b"cd"]);
        let dest = dir.path().join("out");
        std::fs::write(&dest, vec![b'x'; 4096]).unwrap();

        ChunkMerger::new(8)
            .merge(&chunks, &dest, &MergeExpectations::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn size_mismatch_is_reported_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_chunks(dir.path(), &[b"abc"]);
        let dest = dir.path().join("out");

        let err = ChunkMerger::new(8)
            .merge(
                &chunks,
                &dest,
                &MergeExpectations {
                    content_length: Some(4),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::SizeMismatch { expected: 4, actual: 3 }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancelled_merge_stops_copying() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_chunks(dir.path(), &[&[1u8; 4096], &[2u8; 4096]]);
        let dest = dir.path().join("out");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ChunkMerger::new(1024)
            .merge(&chunks, &dest, &MergeExpectations::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Cancelled));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn hash_mismatch_deletes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_chunks(dir.path(), &[b"a", b"bc"]);
        let dest = dir.path().join("out");

        let err = ChunkMerger::new(8)
            .merge(
                &chunks,
                &dest,
                &MergeExpectations {
                    expected_sha256: Some("deadbeef".into()),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::HashMismatch { .. }));
        assert!(!dest.exists());

        let ok = ChunkMerger::new(8)
            .merge(
                &chunks,
                &dest,
                &MergeExpectations {
                    expected_sha256: Some(
                        "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".into(),
                    ),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(ok.is_ok());
    }
}
