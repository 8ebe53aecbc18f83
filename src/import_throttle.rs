use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Limits how many import batches are reconciled at the same time.
#[derive(Clone)]
pub struct ImportThrottle(Arc<Semaphore>);

impl ImportThrottle {
    pub fn new(limit: usize) -> Self {
        Self(Arc::new(Semaphore::new(limit.max(1))))
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, anyhow::Error> {
        self.0
            .clone()
            .acquire_owned()
            .await
            .context("Import throttle closed")
    }

    pub fn available(&self) -> usize {
        self.0.available_permits()
    }
}
