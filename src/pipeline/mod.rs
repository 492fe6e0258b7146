//! Pipeline stages for profile bundling.
//!
//! Each submodule implements one step; [`crate::bundle::Bundler`] wires them
//! together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ preprocess ──▶ admission ──▶ segment ──▶ postprocess ──▶ package
//! (validate) (JPEG, small)  (permit)     (alpha PNG)  (crop, squares)  (ZIP)
//!                         └────────────── reclaim scope ─────────────────┘
//! ```
//!
//! 1. [`input`]     : type/size validation before any decode
//! 2. [`preprocess`]: orient, pre-crop, downscale, re-encode (`spawn_blocking`)
//! 3. [`admission`] : semaphore bounding concurrent segmentation calls
//! 4. [`segment`]   : the external call on the blocking pool, with timeout
//! 5. [`postprocess`]: alpha cleanup, subject crop, square recomposition
//! 6. [`package`]   : PNG encoding and ZIP assembly
//! 7. [`reclaim`]   : scope guard marking the end of each run

pub mod admission;
pub mod input;
pub mod package;
pub mod postprocess;
pub mod preprocess;
pub mod reclaim;
pub mod segment;

use crate::error::BundleError;
use tokio::task::JoinError;

/// Map a failed blocking task to an internal error.
pub(crate) fn join_error(stage: &'static str, err: JoinError) -> BundleError {
    let detail = if err.is_panic() {
        let payload = err.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string())
    } else {
        err.to_string()
    };
    BundleError::WorkerPanicked { stage, detail }
}
