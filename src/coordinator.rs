//! Drives a single download from capability probe to the verified cache file.
//!
//! The coordinator never returns an error: every path ends in a [`DownloadOutcome`], and
//! the temporary chunk slots it created are removed before it returns, whichever outcome
//! was reached.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{FailureKind, MergeError, TransferError};
use crate::event::{DownloadEvent, DownloadOutcome};
use crate::fetcher::ChunkFetcher;
use crate::hashing::verify_file;
use crate::merger::{ChunkMerger, MergeExpectations, MergeVerdict};
use crate::plan::{chunk_count, ChunkPlan, ChunkRange};
use crate::pool::WorkerPool;
use crate::probe::CapabilityProbe;
use crate::request::DownloadRequest;
use crate::state::CoordinatorState;
use crate::store::{CacheStore, FileStore};
use crate::writer::{BandwidthLimiter, ChunkWriter};

pub struct DownloadCoordinator {
    config: EngineConfig,
    cache: Arc<dyn CacheStore>,
    files: Arc<dyn FileStore>,
    probe: CapabilityProbe,
    fetcher: ChunkFetcher,
    writer: ChunkWriter,
    merger: ChunkMerger,
    pool: WorkerPool,
}

/// What one chunk task left behind.
#[derive(Debug)]
pub struct ChunkResult {
    pub index: usize,
    pub bytes_written: u64,
    pub slot: PathBuf,
    pub error: Option<TransferError>,
}

impl ChunkResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Why a chunk task did not deliver its bytes.
enum ChunkFailure {
    Transfer(TransferError),
    Panicked(String),
}

/// Temporary slot chunk `index` of `output` is written to.
pub fn slot_path(output: &Path, index: usize) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(format!(".part{}", index));
    PathBuf::from(name)
}

impl DownloadCoordinator {
    pub fn new(config: EngineConfig, cache: Arc<dyn CacheStore>, files: Arc<dyn FileStore>) -> Self {
        let client = config.build_client();
        let rate_limiter = config
            .rate_limit_bytes_per_sec
            .and_then(BandwidthLimiter::per_second);

        Self {
            probe: CapabilityProbe::new(client.clone(), config.probe_timeout()),
            fetcher: ChunkFetcher::new(client, config.read_timeout()),
            writer: ChunkWriter::new(config.buffer_size, rate_limiter),
            merger: ChunkMerger::new(config.buffer_size),
            pool: WorkerPool::new(config.worker_threads),
            config,
            cache,
            files,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn run(&self, request: &Arc<DownloadRequest>) -> DownloadOutcome {
        let started = Instant::now();
        let key = request.key();

        let Some(output) = self.cache.allocate(key) else {
            return DownloadOutcome::failure(
                FailureKind::OutputFileUnwritable,
                format!("no cache slot for {}", key),
            );
        };
        request.set_output_file(output.clone());

        if self.cache.is_complete(&output) && self.files.is_file(&output) && self.files.can_read(&output) {
            debug!(key = %key, file = ?output, "already in cache");
            return DownloadOutcome::Success {
                file: output,
                elapsed_ms: elapsed_ms(started),
            };
        }
        if !self.files.can_write(&output) {
            return DownloadOutcome::failure(
                FailureKind::OutputFileUnwritable,
                format!("cannot write {:?}", output),
            );
        }
        if request.is_cancelled() {
            return self.interrupted(request, &output, &[]).await;
        }

        request.set_state(CoordinatorState::ProbingCapability);
        let verdict = tokio::select! {
            _ = request.cancel_token().cancelled() => {
                return self.interrupted(request, &output, &[]).await;
            }
            verdict = self.probe.check(key) => verdict,
        };

        if verdict.not_found_on_server {
            info!(key = %key, "resource not found on server");
            self.cache.delete(&output);
            return DownloadOutcome::NotFound;
        }

        let wanted = request
            .requested_chunk_count()
            .min(self.config.max_chunk_count)
            .max(1);
        match verdict.content_length {
            Some(length) if verdict.supports_range_requests && chunk_count(wanted, length) > 1 => {
                request.set_total(length);
                let plan = ChunkPlan::new(length, wanted);
                self.chunked(request, &output, plan, started).await
            }
            length => {
                if let Some(length) = length {
                    request.set_total(length);
                }
                self.single_stream(request, &output, started).await
            }
        }
    }

    async fn single_stream(&self, request: &Arc<DownloadRequest>, output: &Path, started: Instant) -> DownloadOutcome {
        request.set_state(CoordinatorState::SingleStream);
        request.emit(&DownloadEvent::Start { chunk_count: 1 });

        let cancel = request.cancel_token();
        let result = async {
            let _permit = self.pool.acquire(cancel).await?;
            let stream = self.fetcher.fetch(request.key(), None, cancel).await?;
            let chunk_total = stream.expected_len().unwrap_or(0);
            if chunk_total > 0 {
                request.set_total(chunk_total);
            }
            let mut reported = 0;
            self.writer
                .write(stream, output, cancel, |written| {
                    request.add_downloaded(written - reported);
                    reported = written;
                    request.emit(&DownloadEvent::Progress {
                        chunk_index: 0,
                        downloaded_bytes: written,
                        chunk_total_bytes: chunk_total,
                    });
                })
                .await
        }
        .await;

        match result {
            Ok(bytes) => {
                let extra = request.extra_info();
                match verify_file(output, extra.expected_size, extra.expected_sha256.as_deref(), cancel).await {
                    Ok(()) => {}
                    Err(MergeError::Cancelled) => return self.interrupted(request, output, &[]).await,
                    Err(e) => {
                        warn!(key = %request.key(), error = %e, "downloaded file failed verification");
                        self.cache.delete(output);
                        return DownloadOutcome::failure(e.kind(), e.to_string());
                    }
                }
                if request.is_cancelled() {
                    return self.interrupted(request, output, &[]).await;
                }
                self.complete(request, output, bytes, started)
            }
            Err(TransferError::Cancelled) => self.interrupted(request, output, &[]).await,
            Err(e) => self.transfer_failed(request, output, e),
        }
    }

    async fn chunked(
        &self,
        request: &Arc<DownloadRequest>,
        output: &Path,
        plan: ChunkPlan,
        started: Instant,
    ) -> DownloadOutcome {
        request.set_state(CoordinatorState::ChunkedDownload);
        request.emit(&DownloadEvent::Start { chunk_count: plan.len() });
        debug!(key = %request.key(), chunks = plan.len(), length = plan.content_length(), "chunked download");

        let slots: Vec<PathBuf> = plan.chunks().iter().map(|c| slot_path(output, c.index)).collect();
        let finished: Arc<Vec<AtomicBool>> = Arc::new(plan.chunks().iter().map(|_| AtomicBool::new(false)).collect());
        // Cancelled on first chunk failure; inherits the request's own cancellation.
        let siblings = request.cancel_token().child_token();

        let mut tasks = JoinSet::new();
        for chunk in plan.chunks().iter().copied() {
            let request = request.clone();
            let fetcher = self.fetcher.clone();
            let writer = self.writer.clone();
            let pool = self.pool.clone();
            let siblings = siblings.clone();
            let finished = finished.clone();
            let slot = slots[chunk.index].clone();

            tasks.spawn(async move {
                let result = fetch_chunk(&request, &fetcher, &writer, &pool, &siblings, &chunk, &slot).await;
                if result.is_success() {
                    finished[chunk.index].store(true, Ordering::Release);
                }
                result
            });
        }

        let mut failure: Option<(usize, ChunkFailure)> = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok(ChunkResult {
                    index,
                    bytes_written,
                    error: None,
                    ..
                }) => {
                    debug!(key = %request.key(), chunk = index, bytes = bytes_written, "chunk written");
                    continue;
                }
                Ok(ChunkResult {
                    error: Some(TransferError::Cancelled),
                    ..
                }) => continue,
                Ok(ChunkResult {
                    index, error: Some(e), ..
                }) => (index, ChunkFailure::Transfer(e)),
                Err(e) => (usize::MAX, ChunkFailure::Panicked(e.to_string())),
            };
            if failure.is_none() {
                siblings.cancel();
                failure = Some(error);
            }
        }

        if request.is_cancelled() {
            let finished: Vec<bool> = finished.iter().map(|f| f.load(Ordering::Acquire)).collect();
            let prefix = playable_prefix(&slots, &finished);
            let outcome = self.interrupted(request, output, &prefix).await;
            discard_slots(&slots).await;
            return outcome;
        }

        if let Some((index, failure)) = failure {
            discard_slots(&slots).await;
            return match failure {
                ChunkFailure::Transfer(e) => {
                    warn!(key = %request.key(), chunk = index, error = %e, "chunk failed, aborting download");
                    self.transfer_failed(request, output, e)
                }
                ChunkFailure::Panicked(detail) => {
                    self.cache.delete(output);
                    DownloadOutcome::failure(FailureKind::Internal, detail)
                }
            };
        }

        request.set_state(CoordinatorState::Merging);
        let extra = request.extra_info();
        let expect = MergeExpectations {
            content_length: Some(plan.content_length()),
            expected_size: extra.expected_size,
            expected_sha256: extra.expected_sha256.clone(),
        };
        let merged = self.merger.merge(&slots, output, &expect, request.cancel_token()).await;

        let outcome = match merged {
            // Every slot is complete here, so a stop hands off the whole resource.
            Ok(_) | Err(MergeError::Cancelled) if request.is_cancelled() => {
                self.interrupted(request, output, &slots).await
            }
            Ok(MergeVerdict::Verified { bytes, .. }) => self.complete(request, output, bytes, started),
            Err(e) => {
                warn!(key = %request.key(), error = %e, "merge failed");
                self.cache.delete(output);
                DownloadOutcome::failure(e.kind(), e.to_string())
            }
        };
        discard_slots(&slots).await;
        outcome
    }

    fn complete(&self, request: &DownloadRequest, output: &Path, bytes: u64, started: Instant) -> DownloadOutcome {
        if !self.cache.mark_complete(output) {
            warn!(key = %request.key(), "could not mark cache entry complete");
        }
        self.cache.on_bytes_added(bytes);
        let elapsed_ms = elapsed_ms(started);
        info!(key = %request.key(), bytes, elapsed_ms, "download complete");
        DownloadOutcome::Success {
            file: output.to_path_buf(),
            elapsed_ms,
        }
    }

    fn transfer_failed(&self, request: &DownloadRequest, output: &Path, error: TransferError) -> DownloadOutcome {
        self.cache.delete(output);
        match error {
            TransferError::NotFound(status) => {
                info!(key = %request.key(), status, "resource not found on server");
                DownloadOutcome::NotFound
            }
            e => {
                warn!(key = %request.key(), error = %e, "download failed");
                DownloadOutcome::failure(e.kind(), e.to_string())
            }
        }
    }

    /// Ends a cancelled request. A stop keeps the output file, first rebuilding it from
    /// `prefix` when the download was chunked; a cancel deletes it. A stop that has no
    /// bytes to hand off ends like a cancel.
    async fn interrupted(&self, request: &DownloadRequest, output: &Path, prefix: &[PathBuf]) -> DownloadOutcome {
        if request.stop_requested() {
            if !prefix.is_empty() {
                // The request token already fired; assembling the hand-off file must not see it.
                if let Err(e) = self.merger.concatenate(prefix, output, &CancellationToken::new()).await {
                    warn!(key = %request.key(), error = %e, "could not assemble partial file for hand-off");
                }
            }
            if has_content(output).await {
                info!(key = %request.key(), file = ?output, "download stopped for hand-off");
                return DownloadOutcome::Stopped {
                    file: output.to_path_buf(),
                };
            }
            debug!(key = %request.key(), "stopped before any bytes arrived");
        }

        self.cache.delete(output);
        info!(key = %request.key(), "download cancelled");
        DownloadOutcome::Cancelled
    }
}

async fn fetch_chunk(
    request: &DownloadRequest,
    fetcher: &ChunkFetcher,
    writer: &ChunkWriter,
    pool: &WorkerPool,
    cancel: &CancellationToken,
    chunk: &ChunkRange,
    slot: &Path,
) -> ChunkResult {
    let mut reported = 0;
    let result = async {
        let _permit = pool.acquire(cancel).await?;
        let stream = fetcher.fetch(request.key(), Some(chunk), cancel).await?;
        writer
            .write(stream, slot, cancel, |written| {
                request.add_downloaded(written - reported);
                reported = written;
                request.emit(&DownloadEvent::Progress {
                    chunk_index: chunk.index,
                    downloaded_bytes: written,
                    chunk_total_bytes: chunk.len(),
                });
            })
            .await
    }
    .await;

    ChunkResult {
        index: chunk.index,
        bytes_written: result.as_ref().copied().unwrap_or(reported),
        slot: slot.to_path_buf(),
        error: result.err(),
    }
}

/// Slots making up a valid prefix of the resource: every finished chunk up to and
/// including the first unfinished one, if it got any bytes on disk.
fn playable_prefix(slots: &[PathBuf], finished: &[bool]) -> Vec<PathBuf> {
    let mut prefix = vec![];
    for (slot, done) in slots.iter().zip(finished) {
        if !slot.exists() {
            break;
        }
        prefix.push(slot.clone());
        if !done {
            break;
        }
    }
    prefix
}

async fn has_content(file: &Path) -> bool {
    fs::metadata(file).await.map(|m| m.len() > 0).unwrap_or(false)
}

async fn discard_slots(slots: &[PathBuf]) {
    for slot in slots {
        match fs::remove_file(slot).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(slot = ?slot, error = %e, "could not remove chunk slot"),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_sit_next_to_the_output() {
        let output = Path::new("/cache/abc.mp4");
        assert_eq!(slot_path(output, 0), PathBuf::from("/cache/abc.mp4.part0"));
        assert_eq!(slot_path(output, 3), PathBuf::from("/cache/abc.mp4.part3"));
    }

    #[test]
    fn prefix_stops_after_first_unfinished_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let slots: Vec<PathBuf> = (0..4).map(|i| slot_path(&dir.path().join("out"), i)).collect();
        for slot in &slots {
            std::fs::write(slot, b"x").unwrap();
        }

        assert_eq!(playable_prefix(&slots, &[true, false, true, true]), slots[..2].to_vec());
        assert_eq!(playable_prefix(&slots, &[true, true, true, true]), slots);

        std::fs::remove_file(&slots[0]).unwrap();
        assert!(playable_prefix(&slots, &[false, true, true, true]).is_empty());
    }
}
