//! Storage collaborators of the engine.
//!
//! The engine only needs a handful of cheap metadata operations from its storage layer, so
//! both traits are synchronous. Eviction policy is left entirely to the `CacheStore`
//! implementation; the engine just reports how many bytes it added.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::key::DownloadKey;
use crate::utils::extension_from_url;

const COMPLETE_MARKER_EXT: &str = "done";

pub trait CacheStore: Send + Sync {
    /// Returns the cache slot for `key`, creating whatever directories it needs.
    fn allocate(&self, key: &DownloadKey) -> Option<PathBuf>;
    fn is_complete(&self, file: &Path) -> bool;
    fn mark_complete(&self, file: &Path) -> bool;
    fn delete(&self, file: &Path) -> bool;
    fn on_bytes_added(&self, count: u64);
}

pub trait FileStore: Send + Sync {
    fn exists(&self, file: &Path) -> bool;
    fn is_file(&self, file: &Path) -> bool;
    fn can_read(&self, file: &Path) -> bool;
    fn can_write(&self, file: &Path) -> bool;
}

/// Flat directory cache: one file per key, named after the SHA-256 of the key, with a
/// sibling marker file once the download completed.
pub struct DirCacheStore {
    root: PathBuf,
    added_bytes: AtomicU64,
}

impl DirCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            added_bytes: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_name(key: &DownloadKey) -> String {
        let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        match extension_from_url(key.url()) {
            Some(ext) => format!("{}.{}", digest, ext),
            None => digest,
        }
    }

    /// Bytes reported through `on_bytes_added` since this store was created.
    pub fn accounted_bytes(&self) -> u64 {
        self.added_bytes.load(Ordering::Relaxed)
    }

    /// Completed entries with their sizes.
    pub fn entries(&self) -> std::io::Result<Vec<(PathBuf, u64)>> {
        let mut entries = vec![];
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == COMPLETE_MARKER_EXT) {
                continue;
            }
            if self.is_complete(&path) {
                let size = fs::metadata(&path)?.len();
                entries.push((path, size));
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn marker_path(file: &Path) -> PathBuf {
        let mut name = file.as_os_str().to_os_string();
        name.push(".");
        name.push(COMPLETE_MARKER_EXT);
        PathBuf::from(name)
    }
}

impl CacheStore for DirCacheStore {
    fn allocate(&self, key: &DownloadKey) -> Option<PathBuf> {
        if let Err(e) = fs::create_dir_all(&self.root) {
            warn!(root = ?self.root, error = %e, "cannot create cache directory");
            return None;
        }
        Some(self.root.join(Self::slot_name(key)))
    }

    fn is_complete(&self, file: &Path) -> bool {
        file.is_file() && Self::marker_path(file).is_file()
    }

    fn mark_complete(&self, file: &Path) -> bool {
        match fs::write(Self::marker_path(file), b"") {
            Ok(()) => true,
            Err(e) => {
                warn!(file = ?file, error = %e, "cannot write completion marker");
                false
            }
        }
    }

    fn delete(&self, file: &Path) -> bool {
        let _ = fs::remove_file(Self::marker_path(file));
        match fs::remove_file(file) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(file = ?file, error = %e, "cannot delete cache file");
                false
            }
        }
    }

    fn on_bytes_added(&self, count: u64) {
        self.added_bytes.fetch_add(count, Ordering::Relaxed);
    }
}

/// `FileStore` backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileStore;

impl FileStore for LocalFileStore {
    fn exists(&self, file: &Path) -> bool {
        file.exists()
    }

    fn is_file(&self, file: &Path) -> bool {
        file.is_file()
    }

    fn can_read(&self, file: &Path) -> bool {
        fs::File::open(file).is_ok()
    }

    fn can_write(&self, file: &Path) -> bool {
        match fs::metadata(file) {
            Ok(meta) => meta.is_file() && !meta.permissions().readonly(),
            // Not created yet: the directory has to take it.
            Err(_) => match file.parent() {
                Some(dir) => fs::metadata(dir)
                    .map(|meta| meta.is_dir() && !meta.permissions().readonly())
                    .unwrap_or(false),
                None => false,
            },
        }
    }
}
