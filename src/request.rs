use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{DownloadEvent, Subscriber};
use crate::key::DownloadKey;
use crate::state::CoordinatorState;

/// Caller knowledge about the resource, used only to verify the finished file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraInfo {
    pub expected_size: Option<u64>,
    pub expected_sha256: Option<String>,
}

/// Live state of one download, shared by the registry, its coordinator and every handle.
pub struct DownloadRequest {
    key: DownloadKey,
    attempt_id: Uuid,
    requested_chunk_count: usize,
    extra_info: ExtraInfo,
    downloaded_bytes: AtomicU64,
    total_bytes: AtomicU64,
    output_file: OnceLock<PathBuf>,
    subscribers: Mutex<Vec<Subscriber>>,
    cancel: CancellationToken,
    stop_requested: AtomicBool,
    state: AtomicU8,
    terminal: watch::Sender<Option<DownloadEvent>>,
}

impl DownloadRequest {
    pub(crate) fn new(key: DownloadKey, requested_chunk_count: usize, extra_info: ExtraInfo) -> Arc<Self> {
        let (terminal, _) = watch::channel(None);
        Arc::new(Self {
            key,
            attempt_id: Uuid::new_v4(),
            requested_chunk_count,
            extra_info,
            downloaded_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            output_file: OnceLock::new(),
            subscribers: Mutex::new(vec![]),
            cancel: CancellationToken::new(),
            stop_requested: AtomicBool::new(false),
            state: AtomicU8::new(CoordinatorState::NotStarted as u8),
            terminal,
        })
    }

    pub fn key(&self) -> &DownloadKey {
        &self.key
    }

    pub fn requested_chunk_count(&self) -> usize {
        self.requested_chunk_count
    }

    pub fn extra_info(&self) -> &ExtraInfo {
        &self.extra_info
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CoordinatorState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(key = %self.key, from = %CoordinatorState::from_u8(previous), to = %state, "state change");
        }
    }

    pub(crate) fn add_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_total(&self, bytes: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_output_file(&self, file: PathBuf) {
        let _ = self.output_file.set(file);
    }

    pub(crate) fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.lock().push(subscriber);
    }

    /// Delivers `event` to a snapshot of the subscribers attached right now.
    pub(crate) fn emit(&self, event: &DownloadEvent) {
        let snapshot = self.subscribers.lock().clone();
        for subscriber in snapshot {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                warn!(key = %self.key, "download subscriber panicked");
            }
        }
    }

    /// Delivers the terminal event and wakes every `wait()`er.
    pub(crate) fn finish(&self, event: DownloadEvent) {
        self.set_state(CoordinatorState::Terminal);
        self.emit(&event);
        self.terminal.send_replace(Some(event));
    }
}

/// Caller-side view of a download.
#[derive(Clone)]
pub struct DownloadHandle(Arc<DownloadRequest>);

impl DownloadHandle {
    pub(crate) fn new(request: Arc<DownloadRequest>) -> Self {
        Self(request)
    }

    pub fn key(&self) -> &DownloadKey {
        self.0.key()
    }

    /// Distinguishes two consecutive downloads of the same key.
    pub fn attempt_id(&self) -> Uuid {
        self.0.attempt_id
    }

    pub fn requested_chunk_count(&self) -> usize {
        self.0.requested_chunk_count
    }

    /// Lock-free; the coordinator notices at its next buffer boundary.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    /// Ends the download but keeps what was written, for another consumer to take over.
    pub fn stop(&self) {
        self.0.stop();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub fn state(&self) -> CoordinatorState {
        self.0.state()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.0.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.0.total_bytes.load(Ordering::Relaxed)
    }

    pub fn output_file(&self) -> Option<PathBuf> {
        self.0.output_file.get().cloned()
    }

    /// The terminal event, if the download already ended.
    pub fn outcome(&self) -> Option<DownloadEvent> {
        self.0.terminal.borrow().clone()
    }

    /// Resolves to the terminal event.
    pub async fn wait(&self) -> DownloadEvent {
        let mut rx = self.0.terminal.subscribe();
        let event = match rx.wait_for(Option::is_some).await {
            Ok(event) => event.clone().unwrap_or(DownloadEvent::Cancelled),
            Err(_) => DownloadEvent::Cancelled,
        };
        event
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("key", self.key())
            .field("attempt_id", &self.attempt_id())
            .field("state", &self.state())
            .finish()
    }
}
