//! Error types for the profile-bundle library.
//!
//! Every failure is a [`BundleError`], and every `BundleError` belongs to one
//! [`ErrorKind`]:
//!
//! * **Validation**: the upload itself is unusable (wrong type, empty, too
//!   large). Raised before a single pixel is decoded; never retried.
//! * **Segmentation**: the external subject/background separation step
//!   failed, timed out, or returned a degenerate result. Fatal for the
//!   request; not retried automatically.
//! * **Internal**: anything unexpected while decoding, transforming,
//!   encoding or packaging. Logged with full context at the pipeline
//!   boundary, then surfaced to the caller as a generic message only.
//! * **Config**: the [`crate::config::BundleConfigBuilder`] rejected the
//!   configuration. Never produced per request.
//!
//! Callers facing HTTP clients convert an error into an [`ErrorResponse`]
//! (`status` + caller-safe `detail`) rather than formatting it themselves.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Generic detail returned for every internal failure.
pub const INTERNAL_DETAIL: &str = "Error processing the image";

/// All errors returned by the profile-bundle library.
#[derive(Debug, Error)]
pub enum BundleError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// The upload carried no content type at all.
    #[error("Missing content type; upload a JPG, PNG or WEBP image")]
    MissingContentType,

    /// The declared content type is not one of the accepted image types.
    #[error("Unsupported content type '{content_type}'; upload a JPG, PNG or WEBP image")]
    UnsupportedMediaType { content_type: String },

    /// The upload body was empty.
    #[error("Empty file")]
    EmptyUpload,

    /// The upload exceeds the configured ceiling.
    #[error("Image too large: {size} bytes (max {limit} bytes)")]
    PayloadTooLarge { size: usize, limit: usize },

    // ── Segmentation errors ───────────────────────────────────────────────
    /// The external segmentation call returned an error.
    #[error("Segmentation backend '{backend}' failed: {detail}")]
    SegmentationFailed { backend: String, detail: String },

    /// The external segmentation call returned (almost) nothing.
    #[error("Segmentation returned {bytes} bytes (minimum {minimum})")]
    SegmentationOutputTooSmall { bytes: usize, minimum: usize },

    /// The external segmentation call did not return in time.
    #[error("Segmentation timed out after {elapsed_ms}ms")]
    SegmentationTimeout { elapsed_ms: u64 },

    /// No admission permit became free in time.
    #[error("No segmentation slot became free within {waited_ms}ms")]
    AdmissionTimeout { waited_ms: u64 },

    // ── Internal errors ───────────────────────────────────────────────────
    /// An image could not be decoded.
    #[error("Failed to decode {stage} image: {source}")]
    Decode {
        stage: &'static str,
        #[source]
        source: image::ImageError,
    },

    /// An image could not be encoded.
    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: image::ImageError,
    },

    /// The ZIP archive could not be written.
    #[error("Failed to build archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// A blocking worker panicked or was cancelled.
    #[error("{stage} worker panicked: {detail}")]
    WorkerPanicked { stage: &'static str, detail: String },

    /// Could not create or write the output archive file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Coarse classification of a [`BundleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Segmentation,
    Internal,
    Config,
}

impl BundleError {
    /// Which class of failure this is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BundleError::MissingContentType
            | BundleError::UnsupportedMediaType { .. }
            | BundleError::EmptyUpload
            | BundleError::PayloadTooLarge { .. } => ErrorKind::Validation,
            BundleError::SegmentationFailed { .. }
            | BundleError::SegmentationOutputTooSmall { .. }
            | BundleError::SegmentationTimeout { .. }
            | BundleError::AdmissionTimeout { .. } => ErrorKind::Segmentation,
            BundleError::InvalidConfig(_) => ErrorKind::Config,
            BundleError::Decode { .. }
            | BundleError::Encode { .. }
            | BundleError::Archive(_)
            | BundleError::WorkerPanicked { .. }
            | BundleError::OutputWriteFailed { .. }
            | BundleError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            BundleError::PayloadTooLarge { .. } => 413,
            _ if self.kind() == ErrorKind::Validation => 400,
            _ => 500,
        }
    }

    /// Caller-safe description. Internal details are never included.
    pub fn public_detail(&self) -> String {
        match self.kind() {
            ErrorKind::Validation => self.to_string(),
            ErrorKind::Segmentation => match self {
                BundleError::AdmissionTimeout { .. } => {
                    "Image service is busy, try again later".to_string()
                }
                BundleError::SegmentationTimeout { .. } => {
                    "Background removal timed out".to_string()
                }
                _ => "Background removal returned an empty result".to_string(),
            },
            ErrorKind::Internal | ErrorKind::Config => INTERNAL_DETAIL.to_string(),
        }
    }

    /// Build the structured failure response for this error.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            status: self.status_code(),
            detail: self.public_detail(),
        }
    }
}

/// Structured failure response: numeric status + human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub detail: String,
}

impl From<&BundleError> for ErrorResponse {
    fn from(err: &BundleError) -> Self {
        err.to_response()
    }
}
