//! Represents a container: the top-level namespace backups are written into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A storage container in the local object store.
///
/// Containers are created on demand by the backup pipeline and never
/// removed by it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Container {
    /// Container name, unique within the store.
    pub name: String,

    /// When this container was created.
    pub created_at: DateTime<Utc>,
}
