//! Core data models for the backup streaming engine.
//!
//! `backup` holds the pipeline-facing values (descriptors, locations,
//! outcomes). `container`, `object` and `metadata` map to the local object
//! store's tables via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod backup;
pub mod container;
pub mod metadata;
pub mod object;
