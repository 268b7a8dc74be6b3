use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Bounds how many fetch/write pairs run at once, across every download.
/// Excess chunks simply queue for a permit.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a slot, giving up as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, TransferError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit.map_err(|_| TransferError::Cancelled),
        }
    }
}
