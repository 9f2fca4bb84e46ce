//! Represents an object (segment or manifest) stored in a container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata row for a single stored object.
///
/// The payload lives on disk; this row records its size, digest, and for
/// manifests the `<container>/<prefix>` they cover.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Internal UUID, also used to key user metadata rows.
    pub id: Uuid,

    /// Name of the owning container.
    pub container: String,

    /// Object name within the container.
    pub name: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size of the stored payload in bytes. Zero for manifests.
    pub size_bytes: i64,

    /// Lowercase hex MD5 of the stored payload.
    pub etag: String,

    /// Segment prefix (`<container>/<prefix>`) when this object is a manifest.
    pub manifest: Option<String>,

    /// Timestamp when the object was last written.
    pub last_modified: DateTime<Utc>,
}

impl StoredObject {
    pub fn is_manifest(&self) -> bool {
        self.manifest.is_some()
    }
}
