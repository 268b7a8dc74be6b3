use std::path::PathBuf;
use std::sync::Arc;

use crate::error::FailureKind;

/// Lifecycle notification delivered to every subscriber of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Start {
        chunk_count: usize,
    },
    Progress {
        chunk_index: usize,
        downloaded_bytes: u64,
        chunk_total_bytes: u64,
    },
    Success {
        file: PathBuf,
        elapsed_ms: u64,
    },
    NotFound,
    Cancelled,
    Stopped {
        file: PathBuf,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Start { .. } | DownloadEvent::Progress { .. })
    }
}

/// Terminal value of one coordinator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Success { file: PathBuf, elapsed_ms: u64 },
    NotFound,
    Cancelled,
    Stopped { file: PathBuf },
    Failure { kind: FailureKind, detail: String },
}

impl DownloadOutcome {
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        DownloadOutcome::Failure {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<DownloadOutcome> for DownloadEvent {
    fn from(outcome: DownloadOutcome) -> Self {
        match outcome {
            DownloadOutcome::Success { file, elapsed_ms } => DownloadEvent::Success { file, elapsed_ms },
            DownloadOutcome::NotFound => DownloadEvent::NotFound,
            DownloadOutcome::Cancelled => DownloadEvent::Cancelled,
            DownloadOutcome::Stopped { file } => DownloadEvent::Stopped { file },
            DownloadOutcome::Failure { kind, detail } => DownloadEvent::Failure {
                kind,
                message: detail,
            },
        }
    }
}

/// Callback attached to a download; invoked once per event, in order.
pub type Subscriber = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;

/// Wraps a closure into a [`Subscriber`].
pub fn subscriber<F>(f: F) -> Subscriber
where
    F: Fn(&DownloadEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
