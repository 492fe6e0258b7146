//! End-to-end bundling: one upload in, one ZIP (or one classified error) out.
//!
//! A [`Bundler`] is built once at process start. It owns the shared
//! segmentation backend and the admission controller, so every request
//! served through it competes for the same segmentation permits.
//!
//! ```rust,no_run
//! use profile_bundle::{BundleConfig, Bundler, Upload};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bundler = Bundler::new(BundleConfig::default())?;
//! let bytes = std::fs::read("me.jpg")?;
//! let bundle = bundler.bundle(Upload::new(bytes, "image/jpeg")).await?;
//! std::fs::write("profile.zip", &bundle.archive)?;
//! # Ok(())
//! # }
//! ```

use crate::config::BundleConfig;
use crate::error::{BundleError, ErrorKind};
use crate::output::{BundleEntry, BundleStats, ProfileBundle};
use crate::pipeline::admission::AdmissionController;
use crate::pipeline::input::{self, ImageBuffer, Upload};
use crate::pipeline::package::{build_archive, render_entries};
use crate::pipeline::postprocess::{prepare_subject, PostprocessSettings, SubjectBoundingBox};
use crate::pipeline::preprocess::{self, PreprocessSettings};
use crate::pipeline::reclaim::ReclaimScope;
use crate::pipeline::segment::SegmentationInvoker;
use crate::pipeline::join_error;
use crate::progress::{ProgressCallback, Stage};
use crate::segmenter::{CommandSegmenter, HttpSegmenter, Segmenter};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Segmentation server endpoint, e.g. `http://127.0.0.1:7000/api/remove`.
pub const ENV_SEGMENTER_URL: &str = "PROFILE_BUNDLE_SEGMENTER_URL";
/// rembg-compatible command line, e.g. `rembg i -m u2netp`.
pub const ENV_SEGMENTER_CMD: &str = "PROFILE_BUNDLE_SEGMENTER_CMD";
/// Model used by the fallback rembg command.
pub const DEFAULT_REMBG_MODEL: &str = "u2netp";

/// The resource-bounded normalisation pipeline.
pub struct Bundler {
    config: BundleConfig,
    invoker: SegmentationInvoker,
}

impl Bundler {
    /// Resolve the segmentation backend and set up admission control.
    pub fn new(config: BundleConfig) -> Result<Self, BundleError> {
        let segmenter = resolve_segmenter(&config)?;
        info!(
            "Bundler ready: segmenter '{}', {} segmentation slot(s), {} variant(s)",
            segmenter.name(),
            config.admission_limit,
            config.variants.len()
        );
        let invoker = SegmentationInvoker::new(segmenter, &config);
        Ok(Self { config, invoker })
    }

    pub fn config(&self) -> &BundleConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionController {
        self.invoker.admission()
    }

    /// Run the whole pipeline for one upload.
    ///
    /// Returns a complete archive or a classified error, never a partial
    /// archive. Validation failures return before anything is decoded.
    pub async fn bundle(&self, upload: Upload) -> Result<ProfileBundle, BundleError> {
        let result = self.run(upload).await;
        if let Err(ref e) = result {
            self.report_failure(e);
        }
        result
    }

    /// Bundle and write the archive to `output_path`.
    ///
    /// Uses atomic write (temp file in the same directory + rename) to
    /// prevent partial files.
    pub async fn bundle_to_file(
        &self,
        upload: Upload,
        output_path: impl AsRef<Path>,
    ) -> Result<BundleStats, BundleError> {
        let bundle = self.bundle(upload).await?;
        let path = output_path.as_ref().to_path_buf();
        let stats = bundle.stats.clone();
        let archive = bundle.archive;

        tokio::task::spawn_blocking(move || write_atomic(&path, &archive))
            .await
            .map_err(|e| join_error("write", e))??;
        Ok(stats)
    }

    async fn run(&self, upload: Upload) -> Result<ProfileBundle, BundleError> {
        let total_start = Instant::now();

        // ── Step 1: Validate ─────────────────────────────────────────────
        let input = input::validate_upload(upload, self.config.max_upload_bytes)?;

        // Everything decoded from here on lives inside this scope.
        let _scope = ReclaimScope::enter(self.config.reclaim_hook.clone());
        let input_bytes = input.len();
        info!("Starting bundle: {} bytes of {}", input_bytes, input.mime());
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_bundle_start(input_bytes);
        }

        // ── Step 2: Preprocess ───────────────────────────────────────────
        let started = self.stage_start(Stage::Preprocess);
        let prepared = preprocess::prepare(input, PreprocessSettings::from(&self.config)).await?;
        let preprocess_ms = self.stage_complete(Stage::Preprocess, started);
        let prepared_bytes = prepared.buffer.len();

        // ── Step 3: Admission ────────────────────────────────────────────
        let started = self.stage_start(Stage::Admission);
        let permit = self.invoker.admit().await?;
        let admission_wait_ms = permit.waited().as_millis() as u64;
        self.stage_complete(Stage::Admission, started);

        // ── Step 4: Segment ──────────────────────────────────────────────
        let started = self.stage_start(Stage::Segment);
        let segmented = self.invoker.segment(prepared.buffer, permit).await?;
        let segment_ms = self.stage_complete(Stage::Segment, started);
        let segmented_bytes = segmented.len();

        // ── Step 5 + 6: Postprocess and package ──────────────────────────
        let settings = PostprocessSettings::from(&self.config);
        let variants = self.config.variants.clone();
        let callback = self.config.progress_callback.clone();
        let finished = tokio::task::spawn_blocking(move || {
            finish_blocking(segmented, &settings, &variants, callback.as_ref())
        })
        .await
        .map_err(|e| join_error("postprocess", e))??;

        let stats = BundleStats {
            input_bytes,
            prepared_bytes,
            segmented_bytes,
            archive_bytes: finished.archive.len(),
            source_dims: prepared.source_dims,
            prepared_dims: prepared.prepared_dims,
            subject: finished.subject,
            admission_wait_ms,
            preprocess_ms,
            segment_ms,
            postprocess_ms: finished.postprocess_ms,
            package_ms: finished.package_ms,
            total_ms: total_start.elapsed().as_millis() as u64,
        };

        info!(
            "Bundle complete: {} entries, {} bytes, {}ms total ({}ms segmentation, {}ms queued)",
            finished.entries.len(),
            stats.archive_bytes,
            stats.total_ms,
            stats.segment_ms,
            stats.admission_wait_ms
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_bundle_complete(stats.archive_bytes);
        }

        Ok(ProfileBundle {
            archive: finished.archive,
            entries: finished.entries,
            stats,
        })
    }

    fn stage_start(&self, stage: Stage) -> Instant {
        debug!("Stage {} started", stage);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_start(stage);
        }
        Instant::now()
    }

    fn stage_complete(&self, stage: Stage, started: Instant) -> u64 {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!("Stage {} finished in {}ms", stage, elapsed_ms);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_complete(stage, elapsed_ms);
        }
        elapsed_ms
    }

    /// The single failure boundary: log with full context, notify the
    /// callback with the caller-safe detail only.
    fn report_failure(&self, err: &BundleError) {
        match err.kind() {
            ErrorKind::Validation => warn!("Rejected upload: {}", err),
            ErrorKind::Segmentation => warn!(
                "Segmentation via '{}' failed: {}",
                self.invoker.backend_name(),
                err
            ),
            ErrorKind::Internal | ErrorKind::Config => {
                error!("Bundle failed: {}", error_chain(err))
            }
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_bundle_error(&err.public_detail());
        }
    }
}

/// Synchronous wrapper around [`Bundler::bundle`].
///
/// Creates a temporary tokio runtime internally; use a long-lived
/// [`Bundler`] when serving more than one request.
pub fn bundle_sync(upload: Upload, config: &BundleConfig) -> Result<ProfileBundle, BundleError> {
    let bundler = Bundler::new(config.clone())?;
    tokio::runtime::Runtime::new()
        .map_err(|e| BundleError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(bundler.bundle(upload))
}

// ── Internal helpers ─────────────────────────────────────────────────────

struct Finished {
    entries: Vec<BundleEntry>,
    archive: Vec<u8>,
    subject: Option<SubjectBoundingBox>,
    postprocess_ms: u64,
    package_ms: u64,
}

/// Decode, clean, crop, render every variant, then zip. Blocking.
fn finish_blocking(
    segmented: ImageBuffer,
    settings: &PostprocessSettings,
    variants: &[crate::config::OutputVariant],
    callback: Option<&ProgressCallback>,
) -> Result<Finished, BundleError> {
    let started = Instant::now();
    if let Some(cb) = callback {
        cb.on_stage_start(Stage::Postprocess);
    }
    let subject = prepare_subject(segmented, settings)?;
    let entries = render_entries(&subject, variants)?;
    let subject_box = subject.bbox;
    drop(subject);
    let postprocess_ms = started.elapsed().as_millis() as u64;
    if let Some(cb) = callback {
        cb.on_stage_complete(Stage::Postprocess, postprocess_ms);
    }

    let started = Instant::now();
    if let Some(cb) = callback {
        cb.on_stage_start(Stage::Package);
    }
    let archive = build_archive(&entries)?;
    let package_ms = started.elapsed().as_millis() as u64;
    if let Some(cb) = callback {
        cb.on_stage_complete(Stage::Package, package_ms);
    }

    Ok(Finished {
        entries,
        archive,
        subject: subject_box,
        postprocess_ms,
        package_ms,
    })
}

fn write_atomic(path: &PathBuf, bytes: &[u8]) -> Result<(), BundleError> {
    let fail = |source| BundleError::OutputWriteFailed {
        path: path.clone(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(fail)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(fail)?;
    tmp.write_all(bytes).map_err(fail)?;
    tmp.persist(path).map_err(|e| fail(e.error))?;
    Ok(())
}

fn error_chain(err: &BundleError) -> String {
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

/// Resolve the segmentation backend, from most-specific to least-specific.
///
/// 1. **Pre-built backend** (`config.segmenter`): used as-is.
/// 2. **Server URL** (`PROFILE_BUNDLE_SEGMENTER_URL`): [`HttpSegmenter`]
///    with the configured segmentation timeout.
/// 3. **Command line** (`PROFILE_BUNDLE_SEGMENTER_CMD`): [`CommandSegmenter`].
/// 4. **Fallback**: `rembg i -m u2netp` on `PATH`.
pub fn resolve_segmenter(config: &BundleConfig) -> Result<Arc<dyn Segmenter>, BundleError> {
    if let Some(ref segmenter) = config.segmenter {
        return Ok(Arc::clone(segmenter));
    }

    if let Ok(url) = std::env::var(ENV_SEGMENTER_URL) {
        if !url.trim().is_empty() {
            return Ok(Arc::new(HttpSegmenter::new(
                url.trim(),
                config.segmentation_timeout,
            )));
        }
    }

    if let Ok(line) = std::env::var(ENV_SEGMENTER_CMD) {
        if !line.trim().is_empty() {
            let seg = CommandSegmenter::from_command_line(&line).ok_or_else(|| {
                BundleError::InvalidConfig(format!("{ENV_SEGMENTER_CMD} is not a command line"))
            })?;
            return Ok(Arc::new(seg));
        }
    }

    Ok(Arc::new(CommandSegmenter::rembg(DEFAULT_REMBG_MODEL)))
}
