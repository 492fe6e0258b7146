//! Progress-callback trait for per-stage bundling events.
//!
//! Inject an [`Arc<dyn BundleProgressCallback>`] via
//! [`crate::config::BundleConfigBuilder::progress_callback`] to receive
//! events as a pipeline run moves through its stages. The callback is shared
//! by every request served by one [`crate::Bundler`], so events from
//! concurrent runs interleave.
//!
//! # Example
//!
//! ```rust
//! use profile_bundle::{BundleConfig, BundleProgressCallback, Stage};
//! use std::sync::Arc;
//!
//! struct Log;
//!
//! impl BundleProgressCallback for Log {
//!     fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
//!         eprintln!("{stage} done in {elapsed_ms}ms");
//!     }
//! }
//!
//! let config = BundleConfig::builder()
//!     .progress_callback(Arc::new(Log) as Arc<dyn BundleProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Decode, orient, pre-crop, downscale, re-encode.
    Preprocess,
    /// Waiting for a segmentation permit.
    Admission,
    /// The external segmentation call.
    Segment,
    /// Alpha cleanup, subject crop, square recomposition.
    Postprocess,
    /// PNG encoding and archive assembly.
    Package,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preprocess => "preprocess",
            Stage::Admission => "admission",
            Stage::Segment => "segment",
            Stage::Postprocess => "postprocess",
            Stage::Package => "package",
        };
        f.write_str(name)
    }
}

/// Called by the pipeline as a run progresses.
///
/// Implementations must be `Send + Sync`; stages run on blocking-pool
/// threads. All methods default to no-ops.
pub trait BundleProgressCallback: Send + Sync {
    /// Called once per run after the upload passed validation.
    fn on_bundle_start(&self, input_bytes: usize) {
        let _ = input_bytes;
    }

    /// Called when a stage begins.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage finishes successfully.
    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        let _ = (stage, elapsed_ms);
    }

    /// Called once when the archive is ready.
    fn on_bundle_complete(&self, archive_bytes: usize) {
        let _ = archive_bytes;
    }

    /// Called once when a run fails, with the caller-safe detail.
    fn on_bundle_error(&self, detail: &str) {
        let _ = detail;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BundleProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::BundleConfig`].
pub type ProgressCallback = Arc<dyn BundleProgressCallback>;
