//! Pre-segmentation normalisation: do the cheap work before the expensive call.
//!
//! Steps, in order:
//! 1. decode and apply the EXIF orientation (phone photos are often stored
//!    sideways with a rotation tag)
//! 2. optional square pre-crop, centre lifted by `bias × shorter_side`
//! 3. Lanczos downscale until both `max_side` and `max_pixels` hold
//! 4. re-encode as JPEG: the smallest thing we can hand to segmentation
//!
//! Runs inside `spawn_blocking`; decoding and resampling are CPU-bound and
//! would otherwise stall the async workers accepting requests.

use crate::config::BundleConfig;
use crate::error::BundleError;
use crate::pipeline::input::{ImageBuffer, MimeType};
use crate::pipeline::join_error;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};
use std::io::Cursor;
use tracing::debug;

/// The subset of [`BundleConfig`] the preprocessor needs.
#[derive(Debug, Clone, Copy)]
pub struct PreprocessSettings {
    pub max_side: u32,
    pub max_pixels: u64,
    pub jpeg_quality: u8,
    pub precrop_bias: Option<f32>,
}

impl From<&BundleConfig> for PreprocessSettings {
    fn from(c: &BundleConfig) -> Self {
        Self {
            max_side: c.max_side,
            max_pixels: c.max_pixels,
            jpeg_quality: c.jpeg_quality,
            precrop_bias: c.precrop_bias,
        }
    }
}

/// Output of the preprocessor.
#[derive(Debug)]
pub struct Prepared {
    /// JPEG bytes handed to segmentation.
    pub buffer: ImageBuffer,
    /// Dimensions after orientation correction, before any crop or resize.
    pub source_dims: (u32, u32),
    /// Dimensions of the JPEG in `buffer`.
    pub prepared_dims: (u32, u32),
}

/// Run [`prepare_blocking`] on the blocking pool.
pub async fn prepare(
    input: ImageBuffer,
    settings: PreprocessSettings,
) -> Result<Prepared, BundleError> {
    tokio::task::spawn_blocking(move || prepare_blocking(input, &settings))
        .await
        .map_err(|e| join_error("preprocess", e))?
}

/// Decode, orient, pre-crop, downscale and re-encode `input`.
pub fn prepare_blocking(
    input: ImageBuffer,
    settings: &PreprocessSettings,
) -> Result<Prepared, BundleError> {
    let img = decode_oriented(input.bytes(), input.mime())?;
    drop(input);
    let source_dims = img.dimensions();

    let img = match settings.precrop_bias {
        Some(bias) => precrop_square(img, bias),
        None => img,
    };
    let img = downscale(img, settings.max_side, settings.max_pixels);
    let prepared_dims = img.dimensions();

    let bytes = encode_jpeg(&img, settings.jpeg_quality)?;
    debug!(
        "Preprocessed {}x{} → {}x{} ({} bytes JPEG)",
        source_dims.0,
        source_dims.1,
        prepared_dims.0,
        prepared_dims.1,
        bytes.len()
    );

    Ok(Prepared {
        buffer: ImageBuffer::new(bytes, MimeType::Jpeg),
        source_dims,
        prepared_dims,
    })
}

/// Decode `bytes` and apply its EXIF orientation.
///
/// The container is sniffed from the magic bytes; the declared type is only
/// used when sniffing fails.
pub fn decode_oriented(bytes: &[u8], declared: MimeType) -> Result<DynamicImage, BundleError> {
    let decode_err = |source| BundleError::Decode {
        stage: "upload",
        source,
    };

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| decode_err(image::ImageError::IoError(e)))?;
    if reader.format().is_none() {
        reader.set_format(declared.image_format());
    }

    let mut decoder = reader.into_decoder().map_err(decode_err)?;
    let orientation = decoder
        .orientation()
        .unwrap_or(Orientation::NoTransforms);
    let mut img = DynamicImage::from_decoder(decoder).map_err(decode_err)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Crop to a centred square whose centre sits `bias × side` above the
/// image centre, clamped to the image.
pub fn precrop_square(img: DynamicImage, bias: f32) -> DynamicImage {
    let (w, h) = img.dimensions();
    let side = w.min(h);
    if side == 0 || w == h {
        return img;
    }
    let left = (w - side) / 2;
    let centred_top = ((h - side) / 2) as f32;
    let top = (centred_top - bias * side as f32)
        .round()
        .clamp(0.0, (h - side) as f32) as u32;
    img.crop_imm(left, top, side, side)
}

/// Largest size no bigger than `(w, h)` that keeps the aspect ratio and
/// satisfies `max(w, h) ≤ max_side` and `w × h ≤ max_pixels`.
pub fn fit_within(w: u32, h: u32, max_side: u32, max_pixels: u64) -> (u32, u32) {
    let area = w as u64 * h as u64;
    if w.max(h) <= max_side && area <= max_pixels {
        return (w, h);
    }

    let side_scale = max_side as f64 / w.max(h) as f64;
    let area_scale = (max_pixels as f64 / area as f64).sqrt();
    let scale = side_scale.min(area_scale).min(1.0);

    let mut nw = ((w as f64 * scale).floor() as u32).max(1);
    let mut nh = ((h as f64 * scale).floor() as u32).max(1);

    // Float rounding can leave us one pixel over.
    while (nw.max(nh) > max_side || nw as u64 * nh as u64 > max_pixels) && (nw > 1 || nh > 1) {
        if nw >= nh {
            nw -= 1;
        } else {
            nh -= 1;
        }
    }
    (nw, nh)
}

/// Lanczos downscale to [`fit_within`]; never upscales.
pub fn downscale(img: DynamicImage, max_side: u32, max_pixels: u64) -> DynamicImage {
    let (w, h) = img.dimensions();
    let (nw, nh) = fit_within(w, h, max_side, max_pixels);
    if (nw, nh) == (w, h) {
        return img;
    }
    img.resize_exact(nw, nh, FilterType::Lanczos3)
}

/// Encode as baseline RGB JPEG. Any alpha channel is dropped.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, BundleError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder)
        .map_err(|source| BundleError::Encode {
            what: "pre-segmentation JPEG".into(),
            source,
        })?;
    Ok(buf)
}
