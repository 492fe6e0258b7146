//! Post-segmentation geometry: clean the alpha, crop to the subject, and
//! recompose one square canvas per output variant.
//!
//! Rules (applied in order):
//! 1. [`clean_alpha`]: zero alpha below a cutoff, removing the faint halo
//!    segmentation leaves around the subject
//! 2. [`crop_to_subject`]: crop to the padded bounding box of pixels whose
//!    alpha exceeds a threshold; a fully transparent image is left untouched
//! 3. [`square_and_resize`]: paste onto a transparent square, lifted by a
//!    vertical bias, then Lanczos-resample to the target size
//!
//! Steps 1–2 run once per request; step 3 runs once per variant and only
//! reads the shared base image.

use crate::config::{BundleConfig, OutputVariant};
use crate::error::BundleError;
use crate::pipeline::input::ImageBuffer;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The subset of [`BundleConfig`] the postprocessor needs.
#[derive(Debug, Clone, Copy)]
pub struct PostprocessSettings {
    pub alpha_cutoff: u8,
    pub crop_padding_ratio: f32,
    pub crop_alpha_threshold: u8,
}

impl From<&BundleConfig> for PostprocessSettings {
    fn from(c: &BundleConfig) -> Self {
        Self {
            alpha_cutoff: c.alpha_cutoff,
            crop_padding_ratio: c.crop_padding_ratio,
            crop_alpha_threshold: c.crop_alpha_threshold,
        }
    }
}

/// Half-open pixel rectangle: `x0 ≤ x < x1`, `y0 ≤ y < y1`.
///
/// Always non-empty; "no subject" is represented by `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectBoundingBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl SubjectBoundingBox {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

/// Binary mask over an image's alpha channel: set iff `alpha > threshold`.
pub struct AlphaMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl AlphaMask {
    pub fn from_alpha(img: &RgbaImage, threshold: u8) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
            bits: img.pixels().map(|p| p[3] > threshold).collect(),
        }
    }

    /// Number of set pixels.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Minimal rectangle enclosing every set pixel.
    pub fn bounding_box(&self) -> Option<SubjectBoundingBox> {
        let mut bbox: Option<SubjectBoundingBox> = None;
        for (i, &set) in self.bits.iter().enumerate() {
            if !set {
                continue;
            }
            let x = (i % self.width as usize) as u32;
            let y = (i / self.width as usize) as u32;
            bbox = Some(match bbox {
                None => SubjectBoundingBox {
                    x0: x,
                    y0: y,
                    x1: x + 1,
                    y1: y + 1,
                },
                Some(b) => SubjectBoundingBox {
                    x0: b.x0.min(x),
                    y0: b.y0.min(y),
                    x1: b.x1.max(x + 1),
                    y1: b.y1.max(y + 1),
                },
            });
        }
        debug_assert!(bbox.map_or(true, |b| b.x1 <= self.width && b.y1 <= self.height));
        bbox
    }
}

// ── Rule 1: alpha cleanup ────────────────────────────────────────────────────

/// Set every alpha sample below `cutoff` to 0. Colour channels are untouched.
pub fn clean_alpha(img: &mut RgbaImage, cutoff: u8) {
    for p in img.pixels_mut() {
        if p[3] < cutoff {
            p[3] = 0;
        }
    }
}

// ── Rule 2: subject crop ─────────────────────────────────────────────────────

/// Bounding box of pixels with `alpha > alpha_threshold`.
pub fn subject_bbox(img: &RgbaImage, alpha_threshold: u8) -> Option<SubjectBoundingBox> {
    AlphaMask::from_alpha(img, alpha_threshold).bounding_box()
}

/// Crop to the subject box grown by `max(box_w, box_h) × padding_ratio` on
/// every side, clamped to the image.
///
/// Returns the image unchanged, and `None`, when no pixel qualifies.
pub fn crop_to_subject(
    img: RgbaImage,
    padding_ratio: f32,
    alpha_threshold: u8,
) -> (RgbaImage, Option<SubjectBoundingBox>) {
    let Some(bbox) = subject_bbox(&img, alpha_threshold) else {
        return (img, None);
    };

    let pad = (bbox.width().max(bbox.height()) as f32 * padding_ratio) as u32;
    let region = SubjectBoundingBox {
        x0: bbox.x0.saturating_sub(pad),
        y0: bbox.y0.saturating_sub(pad),
        x1: bbox.x1.saturating_add(pad).min(img.width()),
        y1: bbox.y1.saturating_add(pad).min(img.height()),
    };

    let cropped =
        imageops::crop_imm(&img, region.x0, region.y0, region.width(), region.height()).to_image();
    (cropped, Some(region))
}

// ── Rule 3: square recomposition ─────────────────────────────────────────────

/// Where a `w × h` source lands on its square canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquarePlacement {
    pub side: u32,
    pub x: u32,
    pub y: u32,
}

/// Centre a `w × h` source on a `max(w, h)` square, then lift it by
/// `side × vertical_bias`, clamped so the source stays inside the canvas.
pub fn square_placement(w: u32, h: u32, vertical_bias: f32) -> SquarePlacement {
    let side = w.max(h);
    let x = (side - w) / 2;
    let centred = (side - h) / 2;
    let y = (f64::from(centred) - f64::from(side) * f64::from(vertical_bias)) as i64;
    let y = y.clamp(0, (side - h) as i64) as u32;
    SquarePlacement { side, x, y }
}

/// Compose `img` onto a transparent square and resample to `size × size`.
pub fn square_and_resize(img: &RgbaImage, size: u32, vertical_bias: f32) -> RgbaImage {
    let placement = square_placement(img.width(), img.height(), vertical_bias);
    if placement.side == 0 {
        return RgbaImage::new(size, size);
    }
    let mut canvas = RgbaImage::new(placement.side, placement.side);
    imageops::replace(&mut canvas, img, placement.x as i64, placement.y as i64);
    imageops::resize(&canvas, size, size, FilterType::Lanczos3)
}

// ── Stage entry points ───────────────────────────────────────────────────────

/// Base image shared read-only by every variant.
pub struct Subject {
    pub image: RgbaImage,
    pub bbox: Option<SubjectBoundingBox>,
}

/// Decode the segmentation output and apply rules 1–2.
pub fn prepare_subject(
    segmented: ImageBuffer,
    settings: &PostprocessSettings,
) -> Result<Subject, BundleError> {
    let mut img = image::load_from_memory(segmented.bytes())
        .map_err(|source| BundleError::Decode {
            stage: "segmented",
            source,
        })?
        .into_rgba8();
    drop(segmented);

    clean_alpha(&mut img, settings.alpha_cutoff);
    let (image, bbox) = crop_to_subject(img, settings.crop_padding_ratio, settings.crop_alpha_threshold);
    match bbox {
        Some(b) => debug!(
            "Subject crop ({}, {})–({}, {}) → {}x{}",
            b.x0,
            b.y0,
            b.x1,
            b.y1,
            image.width(),
            image.height()
        ),
        None => debug!("No subject above threshold; keeping full frame"),
    }
    Ok(Subject { image, bbox })
}

/// Apply rule 3 for one variant.
pub fn render_variant(subject: &Subject, variant: &OutputVariant) -> RgbaImage {
    square_and_resize(&subject.image, variant.size, variant.vertical_bias)
}
