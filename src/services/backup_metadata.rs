//! Database-specific backup markers and where they come from.
//!
//! Markers are captured from a runner after it exits, written onto the
//! manifest as `X-Object-Meta-*` headers, and read back on restore to walk
//! incremental chains.

use crate::services::object_store::{META_HEADER_PREFIX, ObjectHeaders, ObjectInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PARENT_LOCATION: &str = "parent-location";
pub const PARENT_CHECKSUM: &str = "parent-checksum";
pub const LSN: &str = "lsn";
pub const START_SEGMENT: &str = "start-segment";
pub const START_WAL_FILE: &str = "start-wal-file";
pub const STOP_SEGMENT: &str = "stop-segment";
pub const STOP_WAL_FILE: &str = "stop-wal-file";
pub const CHECKPOINT_LOCATION: &str = "checkpoint-location";
pub const LABEL: &str = "label";

/// Marker set for one backup, keyed by lowercase hyphenated names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupMetadata(BTreeMap<String, String>);

impl BackupMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn extend(&mut self, other: BackupMetadata) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `(parent_location, parent_checksum)` of an incremental backup.
    pub fn parent(&self) -> Option<(&str, &str)> {
        Some((self.get(PARENT_LOCATION)?, self.get(PARENT_CHECKSUM)?))
    }

    pub fn lsn(&self) -> Option<&str> {
        self.get(LSN)
    }

    /// Decode the `X-Object-Meta-*` headers of a manifest.
    pub fn from_object_info(info: &ObjectInfo) -> Self {
        Self(info.user_metadata())
    }

    /// Encode as `X-Object-Meta-*` headers.
    pub fn write_headers(&self, headers: &mut ObjectHeaders) {
        for (key, value) in &self.0 {
            headers.insert(format!("{META_HEADER_PREFIX}{key}"), value.clone());
        }
    }
}

impl FromIterator<(String, String)> for BackupMetadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

/// Parse a Postgres backup label (`KEY: VALUE` per line).
///
/// Unknown keys are ignored; WAL location lines yield both the segment and
/// the WAL file name.
pub fn parse_pg_label(text: &str) -> BackupMetadata {
    let mut metadata = BackupMetadata::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "START WAL LOCATION" => {
                if let Some((segment, wal_file)) = split_wal_location(value) {
                    metadata.insert(START_SEGMENT, segment);
                    metadata.insert(START_WAL_FILE, wal_file);
                }
            }
            "STOP WAL LOCATION" => {
                if let Some((segment, wal_file)) = split_wal_location(value) {
                    metadata.insert(STOP_SEGMENT, segment);
                    metadata.insert(STOP_WAL_FILE, wal_file);
                }
            }
            "CHECKPOINT LOCATION" => metadata.insert(CHECKPOINT_LOCATION, value),
            "LABEL" => metadata.insert(LABEL, value),
            _ => {}
        }
    }
    metadata
}

/// `-1/3000028 (file 000000010000000000000003)` → (`-1/3000028`, `000000010000000000000003`).
fn split_wal_location(value: &str) -> Option<(&str, &str)> {
    let (segment, rest) = value.split_once("(file ")?;
    let wal_file = rest.trim_end().strip_suffix(')')?;
    Some((segment.trim(), wal_file.trim()))
}

/// Last LSN reported by an xtrabackup-family tool on stderr.
///
/// Recognises `Transaction log of lsn (A) to (B) was copied.` (B wins) and
/// the older `The latest check point (for incremental): 'N'`.
pub fn parse_xtrabackup_lsn(log: &str) -> Option<String> {
    let mut lsn = None;
    for line in log.lines() {
        if let Some(rest) = line.split("Transaction log of lsn").nth(1) {
            if let Some(value) = rest
                .split(" to ")
                .nth(1)
                .and_then(|part| between(part, '(', ')'))
            {
                lsn = Some(value.to_string());
            }
        } else if let Some(rest) = line.split("The latest check point (for incremental):").nth(1)
        {
            if let Some(value) = between(rest, '\'', '\'') {
                lsn = Some(value.to_string());
            }
        }
    }
    lsn
}

fn between(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)? + open.len_utf8();
    let len = text[start..].find(close)?;
    let value = text[start..start + len].trim();
    (!value.is_empty() && value.chars().all(|c| c.is_ascii_digit())).then_some(value)
}
