//! src/services/local_store.rs
//!
//! LocalObjectStore: a Swift-like object store backed by SQLite for metadata
//! and local disk for object payloads sharded beneath
//! `base_path/{container}/{shard}/{shard}/{name}`.
//!
//! ETags are computed from the bytes actually written, and manifest objects
//! (`X-Object-Manifest`) report the digest of their segments' hex ETags, so
//! the pipelines' integrity checks run against real comparisons.

use crate::models::{container::Container, metadata::ObjectMetadata, object::StoredObject};
use crate::services::object_store::{
    AccountInfo, ByteStream, CONTENT_TYPE_HEADER, ContainerInfo, ETAG_HEADER, MANIFEST_HEADER,
    META_HEADER_PREFIX, ObjectBody, ObjectHeaders, ObjectInfo, ObjectStore, StoreError,
    StoreResult, strip_etag_quotes,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, TryStreamExt, pin_mut};
use md5::Context;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");
const MAX_OBJECT_NAME_LEN: usize = 1024;
const MAX_CONTAINER_NAME_LEN: usize = 256;

#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    storage_url: String,
}

impl LocalObjectStore {
    /// Create a store over an existing pool. The schema must already exist.
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        storage_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            storage_url: storage_url.into(),
        }
    }

    /// Open (creating if needed) the SQLite database and payload directory,
    /// then apply the schema.
    pub async fn connect(
        database_url: &str,
        base_path: impl Into<PathBuf>,
        storage_url: impl Into<String>,
    ) -> StoreResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                debug!("created missing directory {}", parent.display());
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self::new(Arc::new(pool), base_path, storage_url);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Basic name validation to avoid trivial path traversal vectors.
    fn ensure_object_name_safe(&self, name: &str) -> StoreResult<()> {
        let reject = |reason: &str| {
            Err(StoreError::InvalidName {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };
        if name.is_empty() || name.len() > MAX_OBJECT_NAME_LEN {
            return reject("must be between 1 and 1024 bytes");
        }
        if name.starts_with('/') || name.contains("..") {
            return reject("must not start with `/` or contain `..`");
        }
        if name
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return reject("must not contain control characters or backslashes");
        }
        Ok(())
    }

    /// Container names follow Swift rules: 1–256 bytes, no `/`.
    fn ensure_container_name_safe(&self, name: &str) -> StoreResult<()> {
        let reject = |reason: &str| {
            Err(StoreError::InvalidName {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };
        if name.is_empty() || name.len() > MAX_CONTAINER_NAME_LEN {
            return reject("must be between 1 and 256 bytes");
        }
        if name.contains('/') || name == "." || name == ".." {
            return reject("must not contain `/` or be a relative path");
        }
        if name.bytes().any(|b| b.is_ascii_control()) {
            return reject("must not contain control characters");
        }
        Ok(())
    }

    fn container_root(&self, container: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(container);
        path
    }

    /// Two-level shard directories from MD5(container/name) to keep
    /// directories small when a backup has many segments.
    fn object_shards(container: &str, name: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, name));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, container: &str, name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(container, name);
        let mut path = self.container_root(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(name);
        path
    }

    async fn fetch_container(&self, container: &str) -> StoreResult<Container> {
        self.ensure_container_name_safe(container)?;
        sqlx::query_as::<_, Container>("SELECT name, created_at FROM containers WHERE name = ?")
            .bind(container)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StoreError::ContainerNotFound(container.to_string()),
                other => StoreError::Sqlx(other),
            })
    }

    async fn fetch_object(&self, container: &str, name: &str) -> StoreResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT id, container, name, content_type, size_bytes, etag, manifest, last_modified
             FROM objects
             WHERE container = ? AND name = ?",
        )
        .bind(container)
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::ObjectNotFound {
                container: container.to_string(),
                object: name.to_string(),
            },
            other => StoreError::Sqlx(other),
        })
    }

    async fn fetch_metadata(&self, object_id: Uuid) -> StoreResult<Vec<ObjectMetadata>> {
        let rows = sqlx::query_as::<_, ObjectMetadata>(
            "SELECT object_id, key, value FROM object_metadata WHERE object_id = ? ORDER BY key",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Objects whose name starts with `prefix`, in byte-wise name order.
    ///
    /// `LIKE` is avoided on purpose: `_` is a wildcard there and every
    /// segment prefix ends with one.
    pub async fn list_prefix(&self, container: &str, prefix: &str) -> StoreResult<Vec<StoredObject>> {
        let rows = sqlx::query_as::<_, StoredObject>(
            "SELECT id, container, name, content_type, size_bytes, etag, manifest, last_modified
             FROM objects
             WHERE container = ? AND substr(name, 1, length(?)) = ?
             ORDER BY name ASC",
        )
        .bind(container)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Segments referenced by a manifest value `<container>/<prefix>`.
    async fn manifest_segments(&self, manifest: &str) -> StoreResult<Vec<StoredObject>> {
        let (container, prefix) = manifest.split_once('/').ok_or_else(|| StoreError::InvalidName {
            name: manifest.to_string(),
            reason: "manifest must be `<container>/<prefix>`".into(),
        })?;
        let segments = self.list_prefix(container, prefix).await?;
        Ok(segments
            .into_iter()
            .filter(|segment| !segment.is_manifest())
            .collect())
    }

    /// Create a container. Returns `false` when it already existed.
    pub async fn create_container(&self, name: &str) -> StoreResult<bool> {
        self.ensure_container_name_safe(name)?;
        fs::create_dir_all(self.container_root(name)).await?;

        let result = sqlx::query(
            "INSERT INTO containers (name, created_at) VALUES (?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Stream-upload an object to disk and update metadata.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Rejects the body when a supplied `etag` header disagrees.
    /// - Atomically renames into final location.
    /// - Upserts the metadata row and replaces user metadata.
    pub async fn upload_object_stream<S>(
        &self,
        container: &str,
        name: &str,
        headers: &ObjectHeaders,
        stream: S,
    ) -> StoreResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_object_name_safe(name)?;
        let container_rec = self.fetch_container(container).await?;

        let file_path = self.object_path(&container_rec.name, name);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        let etag = format!("{:x}", digest.compute());
        if let Some(expected) = headers.get(ETAG_HEADER) {
            if strip_etag_quotes(expected) != etag {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::ServerIntegrity(name.to_string()));
            }
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }

        let object = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO objects (
                id, container, name, content_type, size_bytes, etag, manifest, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(container, name) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                manifest = excluded.manifest,
                last_modified = excluded.last_modified
            RETURNING id, container, name, content_type, size_bytes, etag, manifest, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&container_rec.name)
        .bind(name)
        .bind(headers.get(CONTENT_TYPE_HEADER).cloned())
        .bind(size_bytes)
        .bind(&etag)
        .bind(headers.get(MANIFEST_HEADER).cloned())
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        let object = match object {
            Ok(obj) => obj,
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                return Err(StoreError::Sqlx(err));
            }
        };

        self.replace_metadata(object.id, headers).await?;
        Ok(object)
    }

    async fn replace_metadata(&self, object_id: Uuid, headers: &ObjectHeaders) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        for (name, value) in headers {
            let Some(key) = name.strip_prefix(META_HEADER_PREFIX) else {
                continue;
            };
            sqlx::query("INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)")
                .bind(object_id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Open the payload of a single (non-manifest) object.
    async fn open_payload(&self, object: &StoredObject) -> StoreResult<File> {
        let file_path = self.object_path(&object.container, &object.name);
        File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::ObjectNotFound {
                    container: object.container.clone(),
                    object: object.name.clone(),
                }
            } else {
                StoreError::Io(err)
            }
        })
    }
}

/// MD5 over the concatenated hex ETags of `segments`, in the order given.
pub fn manifest_etag<'a>(etags: impl IntoIterator<Item = &'a str>) -> String {
    let mut digest = Context::new();
    for etag in etags {
        digest.consume(etag.as_bytes());
    }
    format!("{:x}", digest.compute())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn storage_url(&self) -> &str {
        &self.storage_url
    }

    async fn get_account(&self) -> StoreResult<AccountInfo> {
        let (container_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM containers")
            .fetch_one(&*self.db)
            .await?;
        let (object_count, bytes_used): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM objects")
                .fetch_one(&*self.db)
                .await?;
        Ok(AccountInfo {
            container_count: container_count as u64,
            object_count: object_count as u64,
            bytes_used: bytes_used as u64,
        })
    }

    async fn head_container(&self, container: &str) -> StoreResult<ContainerInfo> {
        let container_rec = self.fetch_container(container).await?;
        let (object_count, bytes_used): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM objects WHERE container = ?",
        )
        .bind(&container_rec.name)
        .fetch_one(&*self.db)
        .await?;
        Ok(ContainerInfo {
            name: container_rec.name,
            object_count: object_count as u64,
            bytes_used: bytes_used as u64,
        })
    }

    async fn put_container(&self, container: &str) -> StoreResult<()> {
        if self.create_container(container).await? {
            debug!("created container {}", container);
        }
        Ok(())
    }

    async fn put_object(
        &self,
        container: &str,
        name: &str,
        body: ObjectBody,
        headers: ObjectHeaders,
    ) -> StoreResult<String> {
        let object = self
            .upload_object_stream(container, name, &headers, body.into_stream())
            .await?;
        Ok(object.etag)
    }

    /// For manifests the ETag is quoted, as Swift does for dynamic large
    /// objects, and the content length is the sum of the segments.
    async fn head_object(&self, container: &str, name: &str) -> StoreResult<ObjectInfo> {
        self.ensure_object_name_safe(name)?;
        let container_rec = self.fetch_container(container).await?;
        let object = self.fetch_object(&container_rec.name, name).await?;

        let mut headers = ObjectHeaders::new();
        for meta in self.fetch_metadata(object.id).await? {
            headers.insert(format!("{META_HEADER_PREFIX}{}", meta.key), meta.value);
        }
        if let Some(content_type) = &object.content_type {
            headers.insert(CONTENT_TYPE_HEADER.to_string(), content_type.clone());
        }

        let (etag, content_length) = match &object.manifest {
            Some(manifest) => {
                headers.insert(MANIFEST_HEADER.to_string(), manifest.clone());
                let segments = self.manifest_segments(manifest).await?;
                let etag = manifest_etag(segments.iter().map(|s| s.etag.as_str()));
                let length: u64 = segments.iter().map(|s| s.size_bytes.max(0) as u64).sum();
                (format!("\"{etag}\""), length)
            }
            None => (object.etag.clone(), object.size_bytes.max(0) as u64),
        };
        headers.insert(ETAG_HEADER.to_string(), etag.clone());

        Ok(ObjectInfo {
            etag,
            content_length,
            headers,
        })
    }

    async fn get_object(&self, container: &str, name: &str) -> StoreResult<ByteStream> {
        self.ensure_object_name_safe(name)?;
        let container_rec = self.fetch_container(container).await?;
        let object = self.fetch_object(&container_rec.name, name).await?;

        let Some(manifest) = &object.manifest else {
            let file = self.open_payload(&object).await?;
            return Ok(ReaderStream::new(file).boxed());
        };

        let segments = self.manifest_segments(manifest).await?;
        debug!(
            "streaming manifest {}/{} over {} segments",
            container,
            name,
            segments.len()
        );
        let paths: Vec<PathBuf> = segments
            .iter()
            .map(|segment| self.object_path(&segment.container, &segment.name))
            .collect();
        let stream = futures::stream::iter(paths)
            .then(|path| async move { File::open(path).await.map(ReaderStream::new) })
            .try_flatten();
        Ok(stream.boxed())
    }
}
