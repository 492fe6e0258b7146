//! Output types returned by a successful bundling run.

use crate::pipeline::package::ARCHIVE_CONTENT_TYPE;
use crate::pipeline::postprocess::SubjectBoundingBox;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The finished deliverable: one ZIP plus what went into it.
#[derive(Clone, Serialize)]
pub struct ProfileBundle {
    /// DEFLATE-compressed ZIP bytes.
    #[serde(skip)]
    pub archive: Vec<u8>,
    /// Archive entries in configured variant order.
    pub entries: Vec<BundleEntry>,
    pub stats: BundleStats,
}

impl ProfileBundle {
    /// Always `application/zip`.
    pub fn content_type(&self) -> &'static str {
        ARCHIVE_CONTENT_TYPE
    }

    /// Entry by archive name, e.g. `profile_512.png`.
    pub fn entry(&self, name: &str) -> Option<&BundleEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl fmt::Debug for ProfileBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileBundle")
            .field("archive_len", &self.archive.len())
            .field("entries", &self.entries)
            .field("stats", &self.stats)
            .finish()
    }
}

/// One PNG inside the archive.
#[derive(Clone, Serialize)]
pub struct BundleEntry {
    /// Canonical name, `profile_<size>.png`.
    pub name: String,
    /// Edge length in pixels.
    pub size: u32,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl fmt::Debug for BundleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleEntry")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Sizes and timings of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleStats {
    pub input_bytes: usize,
    pub prepared_bytes: usize,
    pub segmented_bytes: usize,
    pub archive_bytes: usize,
    /// After orientation correction.
    pub source_dims: (u32, u32),
    /// As handed to segmentation.
    pub prepared_dims: (u32, u32),
    /// Padded subject region, `None` when segmentation found no subject.
    pub subject: Option<SubjectBoundingBox>,
    /// Time spent queueing for a segmentation permit.
    pub admission_wait_ms: u64,
    pub preprocess_ms: u64,
    pub segment_ms: u64,
    pub postprocess_ms: u64,
    pub package_ms: u64,
    pub total_ms: u64,
}
