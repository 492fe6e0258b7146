//! Configuration types for profile bundling.
//!
//! All pipeline behaviour is controlled through [`BundleConfig`], built via
//! its [`BundleConfigBuilder`]. One record replaces the handful of
//! near-identical pipelines a deployment would otherwise keep around (one per
//! crop policy / threshold / quality combination): pick a [`Profile`] and
//! override the knobs that differ.

use crate::error::BundleError;
use crate::pipeline::reclaim::ReclaimHook;
use crate::progress::ProgressCallback;
use crate::segmenter::Segmenter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default upload ceiling: 8 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 8 * 1024 * 1024;

/// Configuration for building a profile bundle.
///
/// Built via [`BundleConfig::builder()`], [`BundleConfig::from_profile()`]
/// or [`BundleConfig::default()`].
///
/// # Example
/// ```rust
/// use profile_bundle::{BundleConfig, OutputVariant};
///
/// let config = BundleConfig::builder()
///     .max_side(640)
///     .admission_limit(2)
///     .variants(vec![OutputVariant::new(512, 0.10), OutputVariant::new(96, 0.14)])
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct BundleConfig {
    /// Largest accepted upload in bytes. Default: 8 MiB.
    pub max_upload_bytes: usize,

    /// Longest side allowed before segmentation, in pixels. Default: 768.
    ///
    /// Segmentation memory grows with input area, so the image is shrunk
    /// before it reaches the expensive stage.
    pub max_side: u32,

    /// Largest pixel count allowed before segmentation. Default: 900 000.
    pub max_pixels: u64,

    /// JPEG quality of the re-encoded pre-segmentation image (1–100). Default: 85.
    pub jpeg_quality: u8,

    /// Optional square pre-crop, with the crop centre moved up by
    /// `bias × shorter_side`. Default: None (no pre-crop).
    pub precrop_bias: Option<f32>,

    /// Concurrent segmentation invocations allowed process-wide. Default: 1.
    pub admission_limit: usize,

    /// Longest wait for an admission permit. `None` waits forever. Default: 30 s.
    pub admission_timeout: Option<Duration>,

    /// Longest wait for the external segmentation call. `None` waits forever.
    /// Default: 60 s.
    pub segmentation_timeout: Option<Duration>,

    /// Segmentation output shorter than this is treated as a failure. Default: 100.
    pub min_segmentation_bytes: usize,

    /// Tuning forwarded unchanged to the segmentation backend.
    pub segmentation: SegmentationParams,

    /// Alpha samples below this are zeroed after segmentation. Default: 8.
    pub alpha_cutoff: u8,

    /// Padding added around the subject box, as a fraction of its longer side.
    /// Default: 0.18.
    pub crop_padding_ratio: f32,

    /// A pixel counts as subject when its alpha is strictly above this. Default: 10.
    pub crop_alpha_threshold: u8,

    /// Square outputs to produce, in archive order. Default: 512 px and 92 px.
    pub variants: Vec<OutputVariant>,

    /// Pre-built segmentation backend. Takes precedence over env resolution.
    pub segmenter: Option<Arc<dyn Segmenter>>,

    /// Stage-level progress events.
    pub progress_callback: Option<ProgressCallback>,

    /// Called once whenever a pipeline run releases its buffers.
    pub reclaim_hook: Option<ReclaimHook>,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_side: 768,
            max_pixels: 900_000,
            jpeg_quality: 85,
            precrop_bias: None,
            admission_limit: 1,
            admission_timeout: Some(Duration::from_secs(30)),
            segmentation_timeout: Some(Duration::from_secs(60)),
            min_segmentation_bytes: 100,
            segmentation: SegmentationParams::default(),
            alpha_cutoff: 8,
            crop_padding_ratio: 0.18,
            crop_alpha_threshold: 10,
            variants: vec![OutputVariant::new(512, 0.10), OutputVariant::new(92, 0.14)],
            segmenter: None,
            progress_callback: None,
            reclaim_hook: None,
        }
    }
}

impl fmt::Debug for BundleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleConfig")
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("max_side", &self.max_side)
            .field("max_pixels", &self.max_pixels)
            .field("jpeg_quality", &self.jpeg_quality)
            .field("precrop_bias", &self.precrop_bias)
            .field("admission_limit", &self.admission_limit)
            .field("admission_timeout", &self.admission_timeout)
            .field("segmentation_timeout", &self.segmentation_timeout)
            .field("min_segmentation_bytes", &self.min_segmentation_bytes)
            .field("segmentation", &self.segmentation)
            .field("alpha_cutoff", &self.alpha_cutoff)
            .field("crop_padding_ratio", &self.crop_padding_ratio)
            .field("crop_alpha_threshold", &self.crop_alpha_threshold)
            .field("variants", &self.variants)
            .field("segmenter", &self.segmenter.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

impl BundleConfig {
    /// Create a new builder seeded with the defaults.
    pub fn builder() -> BundleConfigBuilder {
        BundleConfigBuilder {
            config: Self::default(),
        }
    }

    /// Create a new builder seeded with a named profile.
    pub fn from_profile(profile: Profile) -> BundleConfigBuilder {
        let mut config = Self::default();
        match profile {
            Profile::Standard => {}
            Profile::Portrait => {
                config.precrop_bias = Some(0.12);
                config.crop_padding_ratio = 0.12;
                config.variants =
                    vec![OutputVariant::new(512, 0.08), OutputVariant::new(96, 0.12)];
            }
            Profile::LowMemory => {
                config.max_side = 640;
                config.max_pixels = 500_000;
                config.jpeg_quality = 80;
                config.alpha_cutoff = 12;
            }
        }
        BundleConfigBuilder { config }
    }
}

/// Builder for [`BundleConfig`].
pub struct BundleConfigBuilder {
    config: BundleConfig,
}

impl fmt::Debug for BundleConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl BundleConfigBuilder {
    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn max_side(mut self, px: u32) -> Self {
        self.config.max_side = px;
        self
    }

    pub fn max_pixels(mut self, px: u64) -> Self {
        self.config.max_pixels = px;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn precrop_bias(mut self, bias: Option<f32>) -> Self {
        self.config.precrop_bias = bias;
        self
    }

    pub fn admission_limit(mut self, n: usize) -> Self {
        self.config.admission_limit = n;
        self
    }

    pub fn admission_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.admission_timeout = timeout;
        self
    }

    pub fn segmentation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.segmentation_timeout = timeout;
        self
    }

    pub fn min_segmentation_bytes(mut self, bytes: usize) -> Self {
        self.config.min_segmentation_bytes = bytes;
        self
    }

    pub fn segmentation(mut self, params: SegmentationParams) -> Self {
        self.config.segmentation = params;
        self
    }

    pub fn alpha_cutoff(mut self, cutoff: u8) -> Self {
        self.config.alpha_cutoff = cutoff;
        self
    }

    pub fn crop_padding_ratio(mut self, ratio: f32) -> Self {
        self.config.crop_padding_ratio = ratio;
        self
    }

    pub fn crop_alpha_threshold(mut self, threshold: u8) -> Self {
        self.config.crop_alpha_threshold = threshold;
        self
    }

    pub fn variants(mut self, variants: Vec<OutputVariant>) -> Self {
        self.config.variants = variants;
        self
    }

    pub fn segmenter(mut self, segmenter: Arc<dyn Segmenter>) -> Self {
        self.config.segmenter = Some(segmenter);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn reclaim_hook(mut self, hook: ReclaimHook) -> Self {
        self.config.reclaim_hook = Some(hook);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<BundleConfig, BundleError> {
        let c = &self.config;
        if c.max_upload_bytes == 0 {
            return Err(BundleError::InvalidConfig(
                "max_upload_bytes must be ≥ 1".into(),
            ));
        }
        if c.max_side == 0 || c.max_pixels == 0 {
            return Err(BundleError::InvalidConfig(
                "max_side and max_pixels must be ≥ 1".into(),
            ));
        }
        if !(1..=100).contains(&c.jpeg_quality) {
            return Err(BundleError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                c.jpeg_quality
            )));
        }
        if c.admission_limit == 0 {
            return Err(BundleError::InvalidConfig(
                "Admission limit must be ≥ 1".into(),
            ));
        }
        if let Some(bias) = c.precrop_bias {
            check_bias("precrop bias", bias)?;
        }
        if !(0.0..=1.0).contains(&c.crop_padding_ratio) {
            return Err(BundleError::InvalidConfig(format!(
                "Crop padding ratio must be 0–1, got {}",
                c.crop_padding_ratio
            )));
        }
        if c.variants.is_empty() {
            return Err(BundleError::InvalidConfig(
                "At least one output variant is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for v in &c.variants {
            if v.size == 0 {
                return Err(BundleError::InvalidConfig(
                    "Variant size must be ≥ 1".into(),
                ));
            }
            if !seen.insert(v.size) {
                return Err(BundleError::InvalidConfig(format!(
                    "Duplicate variant size {} (entry names would collide)",
                    v.size
                )));
            }
            check_bias("variant vertical bias", v.vertical_bias)?;
        }
        Ok(self.config)
    }
}

fn check_bias(what: &str, bias: f32) -> Result<(), BundleError> {
    if (0.0..=0.5).contains(&bias) {
        Ok(())
    } else {
        Err(BundleError::InvalidConfig(format!(
            "{what} must be 0–0.5, got {bias}"
        )))
    }
}

// ── Variants & profiles ──────────────────────────────────────────────────

/// One square output: edge length in pixels plus how far the subject is
/// lifted towards the top of the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputVariant {
    pub size: u32,
    pub vertical_bias: f32,
}

impl OutputVariant {
    pub fn new(size: u32, vertical_bias: f32) -> Self {
        Self {
            size,
            vertical_bias,
        }
    }

    /// Canonical archive entry name, e.g. `profile_512.png`.
    pub fn entry_name(&self) -> String {
        format!("profile_{}.png", self.size)
    }
}

/// Named deployment presets.
///
/// | Profile | Pre-crop | Pre-seg cap | Variants |
/// |---------|----------|-------------|----------|
/// | `Standard`  | none | 768 px / 0.9 MP | 512 @ 0.10, 92 @ 0.14 |
/// | `Portrait`  | square, bias 0.12 | 768 px / 0.9 MP | 512 @ 0.08, 96 @ 0.12 |
/// | `LowMemory` | none | 640 px / 0.5 MP, q80 | 512 @ 0.10, 92 @ 0.14 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    #[default]
    Standard,
    Portrait,
    LowMemory,
}

/// Tuning parameters forwarded to the segmentation backend unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationParams {
    /// Refine edges with alpha matting.
    pub alpha_matting: bool,
    /// Alpha-matting foreground threshold.
    pub foreground_threshold: u8,
    /// Alpha-matting background threshold.
    pub background_threshold: u8,
    /// Alpha-matting erosion radius.
    pub erode_size: u32,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            alpha_matting: false,
            foreground_threshold: 240,
            background_threshold: 10,
            erode_size: 10,
        }
    }
}
