//! Admission control for the segmentation stage.
//!
//! Segmentation is by far the most memory-hungry step, so it is the only one
//! gated. A [`tokio::sync::Semaphore`] with `limit` permits bounds concurrent
//! segmentation calls process-wide; waiters queue in FIFO order.
//!
//! The permit is an owned guard. It is moved into the blocking task that
//! performs the external call and is released when that task ends, on every
//! exit path, including a caller that stopped waiting after a timeout.

use crate::error::BundleError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bounds concurrent segmentation invocations.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    limit: usize,
    wait_timeout: Option<Duration>,
}

/// Proof of admission. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    waited: Duration,
}

impl AdmissionPermit {
    /// How long the caller queued for this permit.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl AdmissionController {
    pub fn new(limit: usize, wait_timeout: Option<Duration>) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            wait_timeout,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free permit, up to the configured timeout.
    pub async fn acquire(&self) -> Result<AdmissionPermit, BundleError> {
        let start = Instant::now();
        let acquire = Arc::clone(&self.semaphore).acquire_owned();

        let permit = match self.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
                BundleError::AdmissionTimeout {
                    waited_ms: start.elapsed().as_millis() as u64,
                }
            })?,
            None => acquire.await,
        }
        .map_err(|_| BundleError::Internal("admission semaphore closed".into()))?;

        let waited = start.elapsed();
        debug!(
            "Admission granted after {}ms ({} of {} free)",
            waited.as_millis(),
            self.semaphore.available_permits(),
            self.limit
        );
        Ok(AdmissionPermit {
            _permit: permit,
            waited,
        })
    }
}
