//! Single-flight front door of the engine.
//!
//! At most one download runs per [`DownloadKey`]. Callers asking for a key that is already
//! in flight are attached to the running request and receive every event from that point
//! on, including the terminal one. A key that was cancelled but has not finished draining
//! is never merged with a new request: the new request is parked as the key's successor
//! and started as soon as the old one emits its terminal event.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::coordinator::DownloadCoordinator;
use crate::error::{EnqueueError, FailureKind};
use crate::event::{DownloadEvent, DownloadOutcome, Subscriber};
use crate::key::DownloadKey;
use crate::request::{DownloadHandle, DownloadRequest, ExtraInfo};
use crate::store::{CacheStore, FileStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub requested_chunk_count: usize,
    pub extra_info: ExtraInfo,
    pub is_prefetch: bool,
    pub is_gallery_batch: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            requested_chunk_count: 1,
            extra_info: ExtraInfo::default(),
            is_prefetch: false,
            is_gallery_batch: false,
        }
    }
}

impl EnqueueOptions {
    pub fn chunked(requested_chunk_count: usize) -> Self {
        Self {
            requested_chunk_count,
            ..Self::default()
        }
    }

    pub fn prefetch() -> Self {
        Self {
            is_prefetch: true,
            ..Self::default()
        }
    }

    pub fn with_extra_info(mut self, extra_info: ExtraInfo) -> Self {
        self.extra_info = extra_info;
        self
    }

    fn validate(&self) -> Result<(), EnqueueError> {
        if self.requested_chunk_count == 0 {
            return Err(EnqueueError::InvalidArgument(
                "requested_chunk_count must be at least 1".into(),
            ));
        }
        if self.requested_chunk_count > 1 && (self.is_prefetch || self.is_gallery_batch) {
            return Err(EnqueueError::InvalidArgument(format!(
                "prefetch and gallery downloads cannot be chunked (requested {} chunks)",
                self.requested_chunk_count
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Enqueued {
    /// The caller was attached to a request that already existed.
    pub already_active: bool,
    pub handle: DownloadHandle,
}

struct Entry {
    active: Arc<DownloadRequest>,
    /// Request parked behind a cancelled `active` that is still draining.
    successor: Option<Arc<DownloadRequest>>,
}

struct RegistryInner {
    entries: Mutex<HashMap<DownloadKey, Entry>>,
    coordinator: Arc<DownloadCoordinator>,
}

#[derive(Clone)]
pub struct DownloadRegistry {
    inner: Arc<RegistryInner>,
}

impl DownloadRegistry {
    pub fn new(config: EngineConfig, cache: Arc<dyn CacheStore>, files: Arc<dyn FileStore>) -> Self {
        Self::with_coordinator(Arc::new(DownloadCoordinator::new(config, cache, files)))
    }

    pub fn with_coordinator(coordinator: Arc<DownloadCoordinator>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                coordinator,
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<DownloadCoordinator> {
        &self.inner.coordinator
    }

    /// Starts downloading `url`, or attaches `callback` to the download already running for
    /// it. Must be called from within a Tokio runtime.
    pub fn enqueue(
        &self,
        url: &str,
        options: EnqueueOptions,
        callback: Option<Subscriber>,
    ) -> Result<Enqueued, EnqueueError> {
        options.validate()?;
        let key = DownloadKey::parse(url)?;

        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            if !entry.active.is_cancelled() {
                return Ok(attach(&entry.active, callback));
            }
            if let Some(successor) = &entry.successor {
                return Ok(attach(successor, callback));
            }

            let successor = DownloadRequest::new(key, options.requested_chunk_count, options.extra_info);
            if let Some(callback) = callback {
                successor.subscribe(callback);
            }
            debug!(key = %successor.key(), "key still draining, parking new request");
            entry.successor = Some(successor.clone());
            return Ok(Enqueued {
                already_active: false,
                handle: DownloadHandle::new(successor),
            });
        }

        let request = DownloadRequest::new(key.clone(), options.requested_chunk_count, options.extra_info);
        if let Some(callback) = callback {
            request.subscribe(callback);
        }
        entries.insert(
            key,
            Entry {
                active: request.clone(),
                successor: None,
            },
        );
        drop(entries);

        self.inner.spawn(request.clone());
        Ok(Enqueued {
            already_active: false,
            handle: DownloadHandle::new(request),
        })
    }

    /// Requests cancellation of `url`, including a request parked behind it. The entry goes
    /// away once the coordinator has wound down. Returns whether anything was running.
    pub fn cancel(&self, url: &str) -> bool {
        let Ok(key) = DownloadKey::parse(url) else {
            return false;
        };
        let entries = self.inner.entries.lock();
        let Some(entry) = entries.get(&key) else {
            return false;
        };
        entry.active.cancel();
        if let Some(successor) = &entry.successor {
            successor.cancel();
        }
        true
    }

    /// Ends the running download of `url` with `Stopped`, keeping its file for hand-off.
    /// A download stopped before any byte reached disk ends with `Cancelled` instead.
    pub fn stop(&self, url: &str) -> bool {
        let Ok(key) = DownloadKey::parse(url) else {
            return false;
        };
        match self.inner.entries.lock().get(&key) {
            Some(entry) => {
                entry.active.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, url: &str) -> bool {
        match DownloadKey::parse(url) {
            Ok(key) => self.inner.entries.lock().contains_key(&key),
            Err(_) => false,
        }
    }

    pub fn handle(&self, url: &str) -> Option<DownloadHandle> {
        let key = DownloadKey::parse(url).ok()?;
        self.inner
            .entries
            .lock()
            .get(&key)
            .map(|entry| DownloadHandle::new(entry.active.clone()))
    }

    pub fn active_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Cancels every download. Parked successors are dropped and get their `Cancelled`
    /// event right away. Running requests stay registered until their coordinator has
    /// removed its files and delivered `Cancelled`, so a URL enqueued again in the meantime
    /// is parked behind them instead of racing them for the same cache slot.
    pub fn clear(&self) {
        let parked: Vec<Arc<DownloadRequest>> = {
            let mut entries = self.inner.entries.lock();
            info!(count = entries.len(), "clearing all downloads");
            entries
                .values_mut()
                .filter_map(|entry| {
                    entry.active.cancel();
                    entry.successor.take()
                })
                .collect()
        };
        for successor in parked {
            successor.cancel();
            successor.finish(DownloadEvent::Cancelled);
        }
    }
}

fn attach(request: &Arc<DownloadRequest>, callback: Option<Subscriber>) -> Enqueued {
    if let Some(callback) = callback {
        request.subscribe(callback);
    }
    Enqueued {
        already_active: true,
        handle: DownloadHandle::new(request.clone()),
    }
}

impl RegistryInner {
    fn spawn(self: &Arc<Self>, request: Arc<DownloadRequest>) {
        let inner = self.clone();
        tokio::spawn(async move {
            let coordinator = inner.coordinator.clone();
            let running = request.clone();
            // Run in its own task so a panic surfaces as a JoinError instead of
            // leaving the key registered forever.
            let outcome = match tokio::spawn(async move { coordinator.run(&running).await }).await {
                Ok(outcome) => outcome,
                Err(e) => DownloadOutcome::failure(FailureKind::Internal, e.to_string()),
            };
            inner.finish(&request, outcome);
        });
    }

    fn finish(self: &Arc<Self>, request: &Arc<DownloadRequest>, outcome: DownloadOutcome) {
        let successor = {
            let mut entries = self.entries.lock();
            match entries.remove(request.key()) {
                Some(mut entry) if Arc::ptr_eq(&entry.active, request) => {
                    let next = entry.successor.take();
                    if let Some(next) = &next {
                        entries.insert(
                            request.key().clone(),
                            Entry {
                                active: next.clone(),
                                successor: None,
                            },
                        );
                    }
                    next
                }
                // Not the request that ran; leave it registered.
                Some(other) => {
                    entries.insert(request.key().clone(), other);
                    None
                }
                None => None,
            }
        };

        debug!(key = %request.key(), ?outcome, "download finished");
        request.finish(outcome.into());

        if let Some(next) = successor {
            debug!(key = %next.key(), "starting parked request");
            self.spawn(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DirCacheStore, LocalFileStore};

    fn registry(dir: &std::path::Path) -> DownloadRegistry {
        DownloadRegistry::new(
            EngineConfig::default(),
            Arc::new(DirCacheStore::new(dir)),
            Arc::new(LocalFileStore),
        )
    }

    #[test]
    fn prefetch_and_gallery_requests_cannot_be_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let prefetch = EnqueueOptions {
            requested_chunk_count: 2,
            is_prefetch: true,
            ..EnqueueOptions::default()
        };
        assert!(matches!(
            registry.enqueue("https://example.org/a.jpg", prefetch, None),
            Err(EnqueueError::InvalidArgument(_))
        ));

        let gallery = EnqueueOptions {
            requested_chunk_count: 3,
            is_gallery_batch: true,
            ..EnqueueOptions::default()
        };
        assert!(registry.enqueue("https://example.org/a.jpg", gallery, None).is_err());
        assert!(!registry.is_running("https://example.org/a.jpg"));
    }

    #[test]
    fn zero_chunks_and_bad_urls_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        assert!(registry
            .enqueue("https://example.org/a.jpg", EnqueueOptions::chunked(0), None)
            .is_err());
        assert!(registry.enqueue("::nope::", EnqueueOptions::default(), None).is_err());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn unknown_keys_are_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        assert!(!registry.cancel("https://example.org/a.jpg"));
        assert!(!registry.stop("https://example.org/a.jpg"));
        assert!(registry.handle("https://example.org/a.jpg").is_none());
        registry.clear();
    }
}
