//! Backup descriptors, segment records, locations and pipeline outcomes.

use crate::errors::PipelineError;
use serde::Serialize;
use std::{fmt, str::FromStr};

/// Width of the zero-padded segment index in segment object names.
const SEGMENT_INDEX_WIDTH: usize = 8;

/// Immutable naming and sizing facts for one backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupDescriptor {
    /// Opaque backup id.
    pub id: String,

    /// Manifest object name, the id plus the runner's extension.
    pub manifest_name: String,

    /// Manifest name up to the first `.`; segments are named after it.
    pub base_filename: String,

    pub container: String,

    /// Read granularity from the runner stream.
    pub chunk_size: usize,

    /// Segment size cap.
    pub segment_max_size: u64,
}

impl BackupDescriptor {
    pub fn new(
        id: impl Into<String>,
        extension: &str,
        container: impl Into<String>,
        chunk_size: usize,
        segment_max_size: u64,
    ) -> Self {
        let id = id.into();
        let manifest_name = format!("{id}{extension}");
        let base_filename = manifest_name
            .split('.')
            .next()
            .unwrap_or(&manifest_name)
            .to_string();
        Self {
            id,
            manifest_name,
            base_filename,
            container: container.into(),
            chunk_size,
            segment_max_size,
        }
    }

    /// Descriptor for a runner-chosen manifest name; the id is its base filename.
    pub fn for_manifest(
        manifest_name: impl Into<String>,
        container: impl Into<String>,
        chunk_size: usize,
        segment_max_size: u64,
    ) -> Self {
        let manifest_name = manifest_name.into();
        let id = manifest_name
            .split('.')
            .next()
            .unwrap_or(&manifest_name)
            .to_string();
        Self {
            base_filename: id.clone(),
            id,
            manifest_name,
            container: container.into(),
            chunk_size,
            segment_max_size,
        }
    }

    /// Object name of segment `index`; lexicographic order matches index order.
    pub fn segment_name(&self, index: u32) -> String {
        format!(
            "{}_{:0width$}",
            self.base_filename,
            index,
            width = SEGMENT_INDEX_WIDTH
        )
    }

    /// Name prefix shared by every segment of this backup.
    pub fn segment_prefix(&self) -> String {
        format!("{}_", self.base_filename)
    }

    /// Manifest header value: `<container>/<base_filename>_`.
    pub fn prefix(&self) -> String {
        format!("{}/{}", self.container, self.segment_prefix())
    }

    /// Largest multiple of the chunk size not exceeding the segment cap.
    pub fn effective_segment_size(&self) -> u64 {
        let chunk = self.chunk_size as u64;
        if chunk == 0 {
            return self.segment_max_size;
        }
        (self.segment_max_size / chunk) * chunk
    }
}

/// A frozen segment after its ETag was verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentRecord {
    pub index: u32,
    pub object_name: String,
    pub length: u64,
    /// Hex MD5 of the segment bytes.
    pub checksum: String,
    /// ETag reported by the store, quotes stripped.
    pub etag: String,
}

/// Where a backup manifest lives: `storage_url/container/object_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub storage_url: String,
    pub container: String,
    pub object_name: String,
}

impl Location {
    pub fn new(
        storage_url: impl Into<String>,
        container: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            storage_url: storage_url.into(),
            container: container.into(),
            object_name: object_name.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.storage_url, self.container, self.object_name
        )
    }
}

impl FromStr for Location {
    type Err = PipelineError;

    /// Split from the right: the last component is the object, the one
    /// before it the container, everything else the storage URL.
    fn from_str(location: &str) -> Result<Self, Self::Err> {
        let mut parts = location.rsplitn(3, '/');
        let object_name = parts.next().unwrap_or_default();
        let container = parts.next().unwrap_or_default();
        let storage_url = parts.next().unwrap_or_default();
        if object_name.is_empty() || container.is_empty() {
            return Err(PipelineError::InvalidLocation(location.to_string()));
        }
        Ok(Self::new(storage_url, container, object_name))
    }
}

/// Result of `BackupService::save`.
#[derive(Debug, Serialize)]
pub struct BackupOutcome {
    pub success: bool,
    pub note: String,
    /// Whole-object checksum, set only on success.
    pub checksum: Option<String>,
    pub location: Option<String>,
    pub segments: Vec<SegmentRecord>,
    /// Typed failure, inspectable by callers.
    #[serde(skip)]
    pub error: Option<PipelineError>,
}

impl BackupOutcome {
    pub fn succeeded(
        note: impl Into<String>,
        checksum: String,
        location: String,
        segments: Vec<SegmentRecord>,
    ) -> Self {
        Self {
            success: true,
            note: note.into(),
            checksum: Some(checksum),
            location: Some(location),
            segments,
            error: None,
        }
    }

    pub fn failed(
        note: impl Into<String>,
        location: Option<String>,
        segments: Vec<SegmentRecord>,
        error: PipelineError,
    ) -> Self {
        Self {
            success: false,
            note: note.into(),
            checksum: None,
            location,
            segments,
            error: Some(error),
        }
    }
}
