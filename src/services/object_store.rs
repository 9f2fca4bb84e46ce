//! src/services/object_store.rs
//!
//! Capability surface over the backup object store. Two providers implement
//! it: `SwiftClient` (HTTP) and `LocalObjectStore` (SQLite + disk). Both follow
//! segmented-large-object semantics: a zero-length object carrying an
//! `X-Object-Manifest: <container>/<prefix>` header stands for the
//! concatenation of every object whose name starts with `<prefix>`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use serde::Serialize;
use std::{collections::BTreeMap, io};
use thiserror::Error;

/// Header naming the segment prefix a manifest object covers.
pub const MANIFEST_HEADER: &str = "x-object-manifest";

/// Prefix of user metadata headers stored alongside an object.
pub const META_HEADER_PREFIX: &str = "x-object-meta-";

/// Request header asking the server to verify the body digest.
pub const ETAG_HEADER: &str = "etag";

pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// A byte stream moving to or from the object store.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Object headers keyed by lowercase header name.
pub type ObjectHeaders = BTreeMap<String, String>;

/// Body of a `put_object` call: either a bounded buffer or a stream read
/// until it ends.
pub enum ObjectBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl ObjectBody {
    pub fn empty() -> Self {
        ObjectBody::Bytes(Bytes::new())
    }

    pub fn into_stream(self) -> ByteStream {
        match self {
            ObjectBody::Bytes(bytes) if bytes.is_empty() => futures::stream::empty().boxed(),
            ObjectBody::Bytes(bytes) => futures::stream::once(async move { Ok(bytes) }).boxed(),
            ObjectBody::Stream(stream) => stream,
        }
    }
}

impl From<Bytes> for ObjectBody {
    fn from(bytes: Bytes) -> Self {
        ObjectBody::Bytes(bytes)
    }
}

/// Result of `head_object`.
#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    /// ETag exactly as the server reported it (possibly quoted).
    pub etag: String,
    pub content_length: u64,
    pub headers: ObjectHeaders,
}

impl ObjectInfo {
    /// The `<container>/<prefix>` value when this object is a manifest.
    pub fn manifest(&self) -> Option<&str> {
        self.headers.get(MANIFEST_HEADER).map(String::as_str)
    }

    /// User metadata with the `x-object-meta-` prefix removed.
    pub fn user_metadata(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(META_HEADER_PREFIX)
                    .map(|key| (key.to_string(), value.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainerInfo {
    pub name: String,
    pub object_count: u64,
    pub bytes_used: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountInfo {
    pub container_count: u64,
    pub object_count: u64,
    pub bytes_used: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("object `{object}` not found in container `{container}`")]
    ObjectNotFound { container: String, object: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("object store rejected `{0}`: body does not match the supplied etag")]
    ServerIntegrity(String),
    #[error("invalid name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("invalid storage url {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ContainerNotFound(_) | StoreError::ObjectNotFound { .. }
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, StoreError::Unauthorized(_))
    }

    /// Failures of the channel to the store rather than answers from it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StoreError::Transport(_) | StoreError::Http(_) | StoreError::Sqlx(_) | StoreError::Io(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Servers may wrap ETags in double quotes; comparisons use the bare value.
pub fn strip_etag_quotes(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// Headers turning an empty object into a manifest over `prefix`.
pub fn manifest_headers(prefix: &str) -> ObjectHeaders {
    let mut headers = ObjectHeaders::new();
    headers.insert(MANIFEST_HEADER.to_string(), prefix.to_string());
    headers
}

/// Operations the backup and restore pipelines need from an object store.
///
/// Adapters do not retry; callers decide retry policy. Implementations are
/// not required to support concurrent use from several pipelines.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Base URL that locations are built from.
    fn storage_url(&self) -> &str;

    async fn get_account(&self) -> StoreResult<AccountInfo>;

    async fn head_container(&self, container: &str) -> StoreResult<ContainerInfo>;

    /// Create a container; succeeds when it already exists.
    async fn put_container(&self, container: &str) -> StoreResult<()>;

    /// Upload an object and return the server-assigned ETag.
    async fn put_object(
        &self,
        container: &str,
        name: &str,
        body: ObjectBody,
        headers: ObjectHeaders,
    ) -> StoreResult<String>;

    async fn head_object(&self, container: &str, name: &str) -> StoreResult<ObjectInfo>;

    /// Stream an object. For a manifest this is the concatenation of its
    /// segments in lexicographic name order.
    async fn get_object(&self, container: &str, name: &str) -> StoreResult<ByteStream>;
}
