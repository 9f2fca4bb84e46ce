//! User metadata (`X-Object-Meta-*`) attached to stored objects.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Key-value metadata entry attached to an object.
///
/// Keys are stored lowercase without the `x-object-meta-` prefix.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectMetadata {
    /// Reference to the associated object.
    pub object_id: Uuid,

    /// Metadata key (e.g., "parent-location").
    pub key: String,

    /// Metadata value as plain text.
    pub value: String,
}
