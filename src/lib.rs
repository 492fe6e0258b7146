//! # profile-bundle
//!
//! Turn an uploaded photo into a ZIP of square, background-free profile
//! pictures, within a fixed memory and concurrency ceiling.
//!
//! ## Why this crate?
//!
//! Subject/background segmentation is the expensive part of making a profile
//! picture: a neural model whose working set grows with the input's pixel
//! count. Running it on an unbounded phone photo, or on many photos at once,
//! is how a small host runs out of memory. This crate shrinks every image
//! before segmentation, lets only a fixed number of segmentation calls run
//! at once, and releases each run's buffers before the next one starts.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Upload (bytes + content type)
//!  │
//!  ├─ 1. Validate     type, emptiness and size checks; nothing decoded yet
//!  ├─ 2. Preprocess   EXIF orientation, optional square pre-crop, downscale,
//!  │                  JPEG re-encode (CPU-bound, spawn_blocking)
//!  ├─ 3. Admission    semaphore permit; at most N segmentations in flight
//!  ├─ 4. Segment      external backend (rembg command or HTTP server)
//!  ├─ 5. Postprocess  alpha cleanup, padded subject crop, square canvases
//!  └─ 6. Package      one PNG per variant, DEFLATE ZIP
//! ```
//!
//! Steps 2–6 run inside a reclaim scope that fires a hook when the run ends,
//! whether it succeeded or not.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use profile_bundle::{BundleConfig, Bundler, Upload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Backend from PROFILE_BUNDLE_SEGMENTER_URL / _CMD, else `rembg i -m u2netp`
//!     let bundler = Bundler::new(BundleConfig::default())?;
//!     let photo = std::fs::read("me.jpg")?;
//!     let bundle = bundler.bundle(Upload::new(photo, "image/jpeg")).await?;
//!     for entry in &bundle.entries {
//!         eprintln!("{} ({} bytes)", entry.name, entry.bytes.len());
//!     }
//!     std::fs::write("profile.zip", &bundle.archive)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `profile-bundle` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! profile-bundle = { version = "0.1", default-features = false }
//! ```
//!
//! ## Choosing a Profile
//!
//! | Profile | Max side | Max pixels | Variants | Best for |
//! |---------|----------|------------|----------|----------|
//! | `standard`   | 768 | 900 000 | 512, 92 | Default |
//! | `portrait`   | 768 | 900 000 | 512, 96 | Head-and-shoulders shots; square pre-crop |
//! | `low-memory` | 640 | 500 000 | 512, 92 | Hosts with well under 1 GiB |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod bundle;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod segmenter;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use bundle::{bundle_sync, resolve_segmenter, Bundler};
pub use config::{BundleConfig, BundleConfigBuilder, OutputVariant, Profile, SegmentationParams};
pub use error::{BundleError, ErrorKind, ErrorResponse};
pub use output::{BundleEntry, BundleStats, ProfileBundle};
pub use pipeline::input::{ImageBuffer, MimeType, Upload};
pub use pipeline::package::ARCHIVE_CONTENT_TYPE;
pub use pipeline::postprocess::SubjectBoundingBox;
pub use pipeline::reclaim::ReclaimHook;
pub use progress::{BundleProgressCallback, NoopProgressCallback, ProgressCallback, Stage};
pub use segmenter::{CommandSegmenter, HttpSegmenter, Segmenter, SegmenterError};
