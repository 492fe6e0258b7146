//! Upload validation: turn a raw upload into an [`ImageBuffer`].
//!
//! Everything here is cheap and runs on the request thread. Type and size
//! checks happen before the pipeline allocates or decodes anything, so a bad
//! upload costs nothing but the bytes already received.

use crate::error::BundleError;
use image::ImageFormat;
use std::fmt;
use tracing::debug;

/// Accepted upload media types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    Jpeg,
    Png,
    Webp,
}

impl MimeType {
    /// Parse a `Content-Type` value. Parameters (`; charset=…`) are ignored.
    pub fn parse(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" => Some(MimeType::Jpeg),
            "image/png" => Some(MimeType::Png),
            "image/webp" => Some(MimeType::Webp),
            _ => None,
        }
    }

    /// Guess from a file extension (used by the CLI).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(MimeType::Jpeg),
            "png" => Some(MimeType::Png),
            "webp" => Some(MimeType::Webp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::Jpeg => "image/jpeg",
            MimeType::Png => "image/png",
            MimeType::Webp => "image/webp",
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            MimeType::Jpeg => ImageFormat::Jpeg,
            MimeType::Png => ImageFormat::Png,
            MimeType::Webp => ImageFormat::WebP,
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw upload as received from the outer layer.
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl Upload {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: Some(content_type.into()),
        }
    }
}

/// Immutable encoded image bytes plus their media type.
///
/// Each stage consumes one `ImageBuffer` and produces the next.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    bytes: Vec<u8>,
    mime: MimeType,
}

impl ImageBuffer {
    pub fn new(bytes: Vec<u8>, mime: MimeType) -> Self {
        Self { bytes, mime }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> MimeType {
        self.mime
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Validate an upload: type first, then emptiness, then size.
pub fn validate_upload(upload: Upload, max_bytes: usize) -> Result<ImageBuffer, BundleError> {
    let content_type = upload
        .content_type
        .as_deref()
        .ok_or(BundleError::MissingContentType)?;
    let mime = MimeType::parse(content_type).ok_or_else(|| BundleError::UnsupportedMediaType {
        content_type: content_type.to_string(),
    })?;

    if upload.bytes.is_empty() {
        return Err(BundleError::EmptyUpload);
    }
    if upload.bytes.len() > max_bytes {
        return Err(BundleError::PayloadTooLarge {
            size: upload.bytes.len(),
            limit: max_bytes,
        });
    }

    debug!("Accepted upload: {} bytes of {}", upload.bytes.len(), mime);
    Ok(ImageBuffer::new(upload.bytes, mime))
}
