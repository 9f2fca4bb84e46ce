#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use guest_backup::services::{
    backup_metadata::BackupMetadata,
    local_store::LocalObjectStore,
    object_store::{
        AccountInfo, ByteStream, ContainerInfo, MANIFEST_HEADER, ObjectBody, ObjectHeaders,
        ObjectInfo, ObjectStore, StoreError, StoreResult,
    },
    runner::{BackupReader, BackupRunner, RunnerError},
    sink::{RestoreSink, RestoreWriter},
};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use std::{
    io::{self, Cursor},
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};
use tempfile::TempDir;
use tokio::io::AsyncWrite;

pub const BAD_SEGMENT_ETAG: &str = "this_is_an_intentional_bad_segment_etag";
pub const BAD_MANIFEST_ETAG: &str = "this_is_an_intentional_bad_manifest_etag";

/// Local store in a fresh temp dir. Keep the `TempDir` alive for the test.
pub async fn local_store() -> (TempDir, Arc<LocalObjectStore>) {
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite://{}", dir.path().join("meta.db").display());
    let store = LocalObjectStore::connect(&db_url, dir.path().join("objects"), "http://swift/v1/AUTH_test")
        .await
        .unwrap();
    (dir, Arc::new(store))
}

pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Runner serving a fixed buffer.
pub struct MemoryRunner {
    manifest_name: String,
    data: Option<Vec<u8>>,
    succeed: bool,
    metadata: BackupMetadata,
    successful: bool,
    pub closed: bool,
    pub aborted: bool,
}

impl MemoryRunner {
    pub fn new(manifest_name: &str, data: Vec<u8>) -> Self {
        Self {
            manifest_name: manifest_name.to_string(),
            data: Some(data),
            succeed: true,
            metadata: BackupMetadata::new(),
            successful: false,
            closed: false,
            aborted: false,
        }
    }

    /// Stream every byte, then report failure on close.
    pub fn failing(mut self) -> Self {
        self.succeed = false;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

#[async_trait]
impl BackupRunner for MemoryRunner {
    fn manifest_name(&self) -> String {
        self.manifest_name.clone()
    }

    async fn open(&mut self) -> Result<BackupReader, RunnerError> {
        let data = self
            .data
            .take()
            .ok_or_else(|| RunnerError::AlreadyOpen(self.manifest_name.clone()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn close(&mut self) -> Result<(), RunnerError> {
        self.closed = true;
        if !self.succeed {
            return Err(RunnerError::Exit {
                command: "memory".into(),
                status: "exit status: 1".into(),
                stderr: "dump failed".into(),
            });
        }
        self.successful = true;
        Ok(())
    }

    async fn abort(&mut self) {
        self.aborted = true;
        self.successful = false;
    }

    fn successful(&self) -> bool {
        self.successful
    }

    fn metadata(&self) -> BackupMetadata {
        self.metadata.clone()
    }
}

/// Wraps a store, counts calls and optionally lies about ETags.
pub struct TamperingStore {
    inner: Arc<dyn ObjectStore>,
    bad_segment: Option<usize>,
    bad_manifest: bool,
    segment_puts: AtomicUsize,
    manifest_puts: AtomicUsize,
    heads: AtomicUsize,
    gets: AtomicUsize,
}

impl TamperingStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            bad_segment: None,
            bad_manifest: false,
            segment_puts: AtomicUsize::new(0),
            manifest_puts: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }

    /// Report a wrong ETag for the `index`-th segment PUT.
    pub fn with_bad_segment(mut self, index: usize) -> Self {
        self.bad_segment = Some(index);
        self
    }

    /// Report a wrong ETag from manifest HEADs.
    pub fn with_bad_manifest(mut self) -> Self {
        self.bad_manifest = true;
        self
    }

    pub fn segment_puts(&self) -> usize {
        self.segment_puts.load(Ordering::SeqCst)
    }

    pub fn manifest_puts(&self) -> usize {
        self.manifest_puts.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for TamperingStore {
    fn storage_url(&self) -> &str {
        self.inner.storage_url()
    }

    async fn get_account(&self) -> StoreResult<AccountInfo> {
        self.inner.get_account().await
    }

    async fn head_container(&self, container: &str) -> StoreResult<ContainerInfo> {
        self.inner.head_container(container).await
    }

    async fn put_container(&self, container: &str) -> StoreResult<()> {
        self.inner.put_container(container).await
    }

    async fn put_object(
        &self,
        container: &str,
        name: &str,
        body: ObjectBody,
        headers: ObjectHeaders,
    ) -> StoreResult<String> {
        let is_manifest = headers.contains_key(MANIFEST_HEADER);
        let etag = self.inner.put_object(container, name, body, headers).await?;
        if is_manifest {
            self.manifest_puts.fetch_add(1, Ordering::SeqCst);
            return Ok(etag);
        }
        let index = self.segment_puts.fetch_add(1, Ordering::SeqCst);
        if self.bad_segment == Some(index) {
            return Ok(BAD_SEGMENT_ETAG.to_string());
        }
        Ok(etag)
    }

    async fn head_object(&self, container: &str, name: &str) -> StoreResult<ObjectInfo> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        let mut info = self.inner.head_object(container, name).await?;
        if self.bad_manifest && info.manifest().is_some() {
            info.etag = BAD_MANIFEST_ETAG.to_string();
        }
        Ok(info)
    }

    async fn get_object(&self, container: &str, name: &str) -> StoreResult<ByteStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_object(container, name).await
    }
}

/// Store answering every HEAD with one ETag and every GET with one body.
pub struct ScriptedStore {
    pub etag: String,
    pub body: Bytes,
    pub heads: AtomicUsize,
    pub gets: AtomicUsize,
    pub requested: Mutex<Vec<(String, String)>>,
    reset_after_body: bool,
}

impl ScriptedStore {
    pub fn new(etag: &str, body: &'static [u8]) -> Self {
        Self {
            etag: etag.to_string(),
            body: Bytes::from_static(body),
            heads: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
            reset_after_body: false,
        }
    }

    /// GETs yield the body and then fail with a connection reset.
    pub fn reset_after_body(mut self) -> Self {
        self.reset_after_body = true;
        self
    }
}

#[async_trait]
impl ObjectStore for ScriptedStore {
    fn storage_url(&self) -> &str {
        "/backup"
    }

    async fn get_account(&self) -> StoreResult<AccountInfo> {
        Ok(AccountInfo::default())
    }

    async fn head_container(&self, container: &str) -> StoreResult<ContainerInfo> {
        Err(StoreError::ContainerNotFound(container.to_string()))
    }

    async fn put_container(&self, _container: &str) -> StoreResult<()> {
        Ok(())
    }

    async fn put_object(
        &self,
        container: &str,
        name: &str,
        _body: ObjectBody,
        _headers: ObjectHeaders,
    ) -> StoreResult<String> {
        Err(StoreError::Unauthorized(format!("{container}/{name} is read-only")))
    }

    async fn head_object(&self, container: &str, name: &str) -> StoreResult<ObjectInfo> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.requested
            .lock()
            .unwrap()
            .push((container.to_string(), name.to_string()));
        Ok(ObjectInfo {
            etag: format!("\"{}\"", self.etag),
            content_length: self.body.len() as u64,
            ..Default::default()
        })
    }

    async fn get_object(&self, _container: &str, _name: &str) -> StoreResult<ByteStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let mut chunks = vec![Ok(self.body.clone())];
        if self.reset_after_body {
            chunks.push(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        }
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// What a [`RecordingSink`] saw; shared with the test after the sink moves
/// into the pipeline.
#[derive(Default)]
pub struct SinkLog {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub aborted: AtomicUsize,
    /// One buffer per `open`.
    pub restores: Mutex<Vec<Vec<u8>>>,
}

impl SinkLog {
    pub fn restores(&self) -> Vec<Vec<u8>> {
        self.restores.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Sink collecting restored bytes in memory.
pub struct RecordingSink {
    log: Arc<SinkLog>,
    succeed: bool,
    successful: bool,
}

impl RecordingSink {
    pub fn new(log: Arc<SinkLog>) -> Self {
        Self {
            log,
            succeed: true,
            successful: false,
        }
    }

    pub fn failing(mut self) -> Self {
        self.succeed = false;
        self
    }
}

struct LogWriter {
    log: Arc<SinkLog>,
    index: usize,
}

impl AsyncWrite for LogWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.log.restores.lock().unwrap()[self.index].extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl RestoreSink for RecordingSink {
    async fn open(&mut self) -> Result<RestoreWriter, RunnerError> {
        self.log.opened.fetch_add(1, Ordering::SeqCst);
        let index = {
            let mut restores = self.log.restores.lock().unwrap();
            restores.push(Vec::new());
            restores.len() - 1
        };
        Ok(Box::new(LogWriter {
            log: self.log.clone(),
            index,
        }))
    }

    async fn close(&mut self) -> Result<(), RunnerError> {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
        if !self.succeed {
            return Err(RunnerError::Exit {
                command: "recording".into(),
                status: "exit status: 1".into(),
                stderr: "restore failed".into(),
            });
        }
        self.successful = true;
        Ok(())
    }

    async fn abort(&mut self) {
        self.log.aborted.fetch_add(1, Ordering::SeqCst);
        self.successful = false;
    }

    fn successful(&self) -> bool {
        self.successful
    }
}
