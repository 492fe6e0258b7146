//! Packaging: encode each variant as PNG and bundle them into one ZIP.
//!
//! PNG keeps the alpha channel and is lossless; `CompressionType::Best` is
//! the equivalent of an "optimised" PNG. The archive is only assembled once
//! every variant has encoded, so a failure part-way never yields a partial
//! archive.

use crate::config::OutputVariant;
use crate::error::BundleError;
use crate::output::BundleEntry;
use crate::pipeline::postprocess::{render_variant, Subject};
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::RgbaImage;
use std::io::{Cursor, Write};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// MIME type of the produced archive.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Encode an RGBA canvas as a maximally compressed PNG.
pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, BundleError> {
    let mut buf = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut buf, CompressionType::Best, PngFilter::Adaptive);
    img.write_with_encoder(encoder)
        .map_err(|source| BundleError::Encode {
            what: format!("{}x{} PNG", img.width(), img.height()),
            source,
        })?;
    Ok(buf)
}

/// Render and encode every variant from the shared subject.
///
/// Each canvas is dropped as soon as its PNG exists, so at most one
/// full-size canvas is alive at a time.
pub fn render_entries(
    subject: &Subject,
    variants: &[OutputVariant],
) -> Result<Vec<BundleEntry>, BundleError> {
    variants
        .iter()
        .map(|variant| {
            let canvas = render_variant(subject, variant);
            let bytes = encode_png(&canvas)?;
            drop(canvas);
            debug!("Encoded {} ({} bytes)", variant.entry_name(), bytes.len());
            Ok(BundleEntry {
                name: variant.entry_name(),
                size: variant.size,
                bytes,
            })
        })
        .collect()
}

/// Write all entries into one DEFLATE-compressed ZIP.
pub fn build_archive(entries: &[BundleEntry]) -> Result<Vec<u8>, BundleError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in entries {
        zip.start_file(entry.name.as_str(), options)?;
        zip.write_all(&entry.bytes)
            .map_err(zip::result::ZipError::from)?;
    }

    Ok(zip.finish()?.into_inner())
}
