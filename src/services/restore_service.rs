//! src/services/restore_service.rs
//!
//! RestoreService: re-verifies a stored manifest against the checksum
//! recorded at backup time, then streams the backup into a restore sink.
//! Incremental backups are restored by walking their parent chain and
//! feeding every link to its own sink, oldest first.

use crate::{
    errors::PipelineError,
    models::backup::Location,
    services::{
        backup_metadata::BackupMetadata,
        object_store::{ByteStream, ObjectStore, strip_etag_quotes},
        runner::RunnerError,
        sink::RestoreSink,
    },
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// An open download of one backup.
///
/// Bytes are pulled with [`RestoreStream::next_chunk`] or
/// [`RestoreStream::copy_to`]; [`RestoreStream::close`] must follow and
/// reports a download that failed part way.
pub struct RestoreStream {
    location: Location,
    body: Option<ByteStream>,
    bytes_read: u64,
    failure: Option<String>,
}

impl RestoreStream {
    fn new(location: Location, body: ByteStream) -> Self {
        Self {
            location,
            body: Some(body),
            bytes_read: 0,
            failure: None,
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn download_error(&self, reason: impl Into<String>) -> PipelineError {
        PipelineError::DownloadError {
            location: self.location.to_string(),
            reason: reason.into(),
        }
    }

    /// Next chunk of the backup, `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, PipelineError> {
        let Some(body) = self.body.as_mut() else {
            return Ok(None);
        };
        match body.next().await {
            Some(Ok(chunk)) => {
                self.bytes_read += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Some(Err(err)) => {
                self.body = None;
                self.failure = Some(err.to_string());
                Err(self.download_error(err.to_string()))
            }
            None => {
                self.body = None;
                Ok(None)
            }
        }
    }

    /// Write the rest of the backup into `writer`. Returns the bytes copied.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> Result<u64, PipelineError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut copied = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            writer
                .write_all(&chunk)
                .await
                .map_err(|err| PipelineError::SinkFailed(RunnerError::Io(err)))?;
            copied += chunk.len() as u64;
        }
        Ok(copied)
    }

    /// Release the download. Fails with `DownloadError` if the stream broke.
    pub fn close(mut self) -> Result<u64, PipelineError> {
        self.body = None;
        match self.failure.take() {
            Some(reason) => Err(self.download_error(reason)),
            None => Ok(self.bytes_read),
        }
    }
}

/// One link of a restore chain.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreStep {
    pub location: String,
    /// Checksum the manifest must match, when known.
    pub checksum: Option<String>,
    /// Zero for the oldest ancestor.
    pub position: usize,
    /// True for the backup that was asked for.
    pub is_target: bool,
    pub metadata: BackupMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoredBackup {
    pub location: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<RestoredBackup>,
    pub total_bytes: u64,
}

#[derive(Clone)]
pub struct RestoreService {
    store: Arc<dyn ObjectStore>,
    verify_checksum: bool,
}

impl RestoreService {
    pub fn new(store: Arc<dyn ObjectStore>, verify_checksum: bool) -> Self {
        Self {
            store,
            verify_checksum,
        }
    }

    /// Open the backup at `location`.
    ///
    /// With verification on and a checksum given, the manifest ETag is
    /// compared first and a mismatch fails with `IntegrityMismatch` before
    /// any byte is downloaded.
    pub async fn load(
        &self,
        location: &str,
        expected_checksum: Option<&str>,
    ) -> Result<RestoreStream, PipelineError> {
        let location: Location = location.parse()?;
        debug!(
            "restoring from container {} object {}",
            location.container, location.object_name
        );

        if let Some(expected) = expected_checksum.filter(|_| self.verify_checksum) {
            let info = self
                .store
                .head_object(&location.container, &location.object_name)
                .await?;
            let actual = strip_etag_quotes(&info.etag);
            if actual != strip_etag_quotes(expected) {
                error!(
                    "checksum of {} is {}, expected {}",
                    location, actual, expected
                );
                return Err(PipelineError::IntegrityMismatch {
                    location: location.to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        } else if expected_checksum.is_some() {
            warn!("checksum verification disabled for {}", location);
        }

        let body = self
            .store
            .get_object(&location.container, &location.object_name)
            .await?;
        Ok(RestoreStream::new(location, body))
    }

    /// Markers stored on the manifest at `location`.
    pub async fn load_metadata(&self, location: &str) -> Result<BackupMetadata, PipelineError> {
        let location: Location = location.parse()?;
        let info = self
            .store
            .head_object(&location.container, &location.object_name)
            .await?;
        Ok(BackupMetadata::from_object_info(&info))
    }

    /// The backup at `location` and all its ancestors, oldest first.
    pub async fn resolve_chain(
        &self,
        location: &str,
        expected_checksum: Option<&str>,
    ) -> Result<Vec<RestoreStep>, PipelineError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some((location.to_string(), expected_checksum.map(str::to_string)));

        while let Some((location, checksum)) = next.take() {
            if !visited.insert(location.clone()) {
                return Err(PipelineError::RestoreChain(format!(
                    "{location} is its own ancestor"
                )));
            }
            let metadata = self.load_metadata(&location).await?;
            next = metadata
                .parent()
                .map(|(parent, sum)| (parent.to_string(), Some(sum.to_string())));
            chain.push(RestoreStep {
                location,
                checksum,
                position: 0,
                is_target: chain.is_empty(),
                metadata,
            });
        }

        chain.reverse();
        for (position, step) in chain.iter_mut().enumerate() {
            step.position = position;
        }
        Ok(chain)
    }

    /// Restore the backup at `location`, replaying its ancestors first.
    ///
    /// `make_sink` is called once per link, in restore order.
    pub async fn restore<F>(
        &self,
        location: &str,
        expected_checksum: Option<&str>,
        mut make_sink: F,
    ) -> Result<RestoreReport, PipelineError>
    where
        F: FnMut(&RestoreStep) -> Box<dyn RestoreSink>,
    {
        let chain = self.resolve_chain(location, expected_checksum).await?;
        info!("restoring {} ({} backups in chain)", location, chain.len());

        let mut report = RestoreReport::default();
        for step in &chain {
            let mut sink = make_sink(step);
            let bytes = self.restore_one(step, sink.as_mut()).await?;
            report.total_bytes += bytes;
            report.restored.push(RestoredBackup {
                location: step.location.clone(),
                bytes,
            });
        }
        Ok(report)
    }

    /// Stream one backup into `sink`. The sink is opened only after the
    /// integrity check passed.
    ///
    /// A broken download or a restore tool exiting non-zero is a
    /// `DownloadError`; `SinkFailed` covers a tool that could not be started
    /// or fed while it still reported success.
    pub async fn restore_one(
        &self,
        step: &RestoreStep,
        sink: &mut dyn RestoreSink,
    ) -> Result<u64, PipelineError> {
        let mut stream = self.load(&step.location, step.checksum.as_deref()).await?;

        let mut writer = match sink.open().await {
            Ok(writer) => writer,
            Err(err) => {
                let _ = stream.close();
                return Err(PipelineError::SinkFailed(err));
            }
        };

        let copied = match stream.copy_to(&mut writer).await {
            Ok(copied) => copied,
            Err(PipelineError::SinkFailed(write_err)) => {
                drop(writer);
                let _ = stream.close();
                let err = write_failure(step, sink, write_err).await;
                error!("restore of {} failed: {}", step.location, err);
                return Err(err);
            }
            Err(err) => {
                drop(writer);
                sink.abort().await;
                let _ = stream.close();
                error!("restore of {} failed: {}", step.location, err);
                return Err(err);
            }
        };
        let shutdown = writer.shutdown().await;
        drop(writer);
        if let Err(err) = shutdown {
            return Err(write_failure(step, sink, RunnerError::Io(err)).await);
        }
        stream.close()?;

        if let Err(err) = sink.close().await {
            error!("restore tool for {} failed: {}", step.location, err);
            return Err(tool_failure(step, err));
        }
        if !sink.successful() {
            return Err(tool_failure(
                step,
                RunnerError::Incomplete(step.location.clone()),
            ));
        }
        info!("restored {} ({} bytes)", step.location, copied);
        Ok(copied)
    }
}

/// A restore tool that exited badly fails the download it was fed.
fn tool_failure(step: &RestoreStep, err: RunnerError) -> PipelineError {
    PipelineError::DownloadError {
        location: step.location.clone(),
        reason: err.to_string(),
    }
}

/// The sink stopped accepting bytes. Wait for the tool so its own exit
/// status and stderr are reported instead of the broken pipe.
async fn write_failure(
    step: &RestoreStep,
    sink: &mut dyn RestoreSink,
    write_err: RunnerError,
) -> PipelineError {
    match sink.close().await {
        Err(exit) => tool_failure(step, exit),
        Ok(()) => PipelineError::SinkFailed(write_err),
    }
}
