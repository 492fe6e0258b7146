//! Segmentation invoker: gate, dispatch, bound and check the external call.
//!
//! The external call is synchronous and slow, so it runs on the blocking
//! pool while holding an [`AdmissionPermit`]. An empty or tiny result is a
//! failure, not something to decode.

use crate::config::{BundleConfig, SegmentationParams};
use crate::error::BundleError;
use crate::pipeline::admission::{AdmissionController, AdmissionPermit};
use crate::pipeline::input::{ImageBuffer, MimeType};
use crate::pipeline::join_error;
use crate::segmenter::{Segmenter, SegmenterError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Calls the shared [`Segmenter`] under admission control.
#[derive(Clone)]
pub struct SegmentationInvoker {
    segmenter: Arc<dyn Segmenter>,
    admission: AdmissionController,
    params: SegmentationParams,
    timeout: Option<Duration>,
    min_output_bytes: usize,
}

impl SegmentationInvoker {
    pub fn new(segmenter: Arc<dyn Segmenter>, config: &BundleConfig) -> Self {
        Self {
            segmenter,
            admission: AdmissionController::new(config.admission_limit, config.admission_timeout),
            params: config.segmentation,
            timeout: config.segmentation_timeout,
            min_output_bytes: config.min_segmentation_bytes,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn backend_name(&self) -> &str {
        self.segmenter.name()
    }

    /// Queue for a segmentation slot.
    pub async fn admit(&self) -> Result<AdmissionPermit, BundleError> {
        self.admission.acquire().await
    }

    /// Run the external call for `input` while holding `permit`.
    ///
    /// The permit moves into the blocking task, so it is released when the
    /// external call returns even if this future gave up waiting for it.
    /// The backend receives the same deadline and is expected to abort
    /// (e.g. kill its child process) once it passes.
    pub async fn segment(
        &self,
        input: ImageBuffer,
        permit: AdmissionPermit,
    ) -> Result<ImageBuffer, BundleError> {
        let segmenter = Arc::clone(&self.segmenter);
        let params = self.params;
        let input_len = input.len();
        let start = Instant::now();
        let deadline = self.timeout.map(|limit| start + limit);

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            segmenter.segment_until(input.bytes(), &params, deadline)
        });

        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task).await.map_err(|_| {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                warn!(
                    "Segmentation via '{}' exceeded {}ms; abandoning call",
                    self.segmenter.name(),
                    limit.as_millis()
                );
                BundleError::SegmentationTimeout { elapsed_ms }
            })?,
            None => task.await,
        };

        let output = joined
            .map_err(|e| join_error("segment", e))?
            .map_err(|e| match e {
                SegmenterError::TimedOut { .. } => BundleError::SegmentationTimeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                },
                e => BundleError::SegmentationFailed {
                    backend: self.segmenter.name().to_string(),
                    detail: e.to_string(),
                },
            })?;

        if output.len() < self.min_output_bytes {
            return Err(BundleError::SegmentationOutputTooSmall {
                bytes: output.len(),
                minimum: self.min_output_bytes,
            });
        }

        debug!(
            "Segmented {} → {} bytes in {}ms",
            input_len,
            output.len(),
            start.elapsed().as_millis()
        );
        Ok(ImageBuffer::new(output, MimeType::Png))
    }
}
