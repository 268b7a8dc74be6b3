use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;
use crate::fetcher::ChunkStream;

/// Global bytes-per-second budget shared by every writer of an engine.
pub struct BandwidthLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: u32,
}

impl BandwidthLimiter {
    pub fn per_second(bytes_per_sec: u32) -> Option<Arc<Self>> {
        let limit = NonZeroU32::new(bytes_per_sec)?;
        Some(Arc::new(Self {
            limiter: RateLimiter::direct(Quota::per_second(limit)),
            burst: limit.get(),
        }))
    }

    /// Waits until `len` bytes may pass, in burst-sized slices. Gives up as soon as `cancel`
    /// fires.
    pub async fn throttle(&self, len: usize, cancel: &CancellationToken) -> Result<(), TransferError> {
        let mut remaining = u32::try_from(len).unwrap_or(u32::MAX);
        while remaining > 0 {
            let step = remaining.min(self.burst);
            if let Some(n) = NonZeroU32::new(step) {
                let ready = tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    ready = self.limiter.until_n_ready(n) => ready,
                };
                if ready.is_err() {
                    break;
                }
            }
            remaining -= step;
        }
        Ok(())
    }
}

/// Copies a fetched body to disk in bounded buffers.
#[derive(Clone)]
pub struct ChunkWriter {
    buffer_size: usize,
    rate_limiter: Option<Arc<BandwidthLimiter>>,
}

impl ChunkWriter {
    pub fn new(buffer_size: usize, rate_limiter: Option<Arc<BandwidthLimiter>>) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            rate_limiter,
        }
    }

    /// Truncates `target` and streams the body into it. `on_progress` receives the running
    /// byte count after every buffer; cancellation is observed between reads and after every
    /// buffer. Whatever was received before cancellation is flushed to disk.
    pub async fn write<F>(
        &self,
        mut stream: ChunkStream,
        target: &Path,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<u64, TransferError>
    where
        F: FnMut(u64),
    {
        let file = File::create(target).await?;
        let mut out = BufWriter::with_capacity(self.buffer_size, file);
        let mut written: u64 = 0;
        let mut reported: u64 = 0;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                item = stream.next_bytes() => Some(item),
            };
            let item = match next {
                Some(item) => item,
                None => {
                    out.flush().await?;
                    return Err(TransferError::Cancelled);
                }
            };
            let Some(bytes) = item.transpose()? else {
                break;
            };
            if bytes.is_empty() {
                continue;
            }

            if let Some(limiter) = &self.rate_limiter {
                if let Err(e) = limiter.throttle(bytes.len(), cancel).await {
                    out.flush().await?;
                    return Err(e);
                }
            }
            out.write_all(&bytes).await?;
            written += bytes.len() as u64;

            if written - reported >= self.buffer_size as u64 {
                reported = written;
                on_progress(written);
                if cancel.is_cancelled() {
                    out.flush().await?;
                    return Err(TransferError::Cancelled);
                }
            }
        }

        out.flush().await?;
        out.into_inner().sync_all().await?;

        if written != reported {
            on_progress(written);
        }
        if let Some(expected) = stream.expected_len() {
            if written != expected {
                return Err(TransferError::Truncated {
                    expected,
                    actual: written,
                });
            }
        }
        Ok(written)
    }
}
