//! src/services/backup_service.rs
//!
//! BackupService: streams a runner's output into the object store as
//! fixed-size segments plus a manifest, verifying every segment ETag and the
//! manifest ETag against checksums computed locally.

use crate::{
    errors::PipelineError,
    models::backup::{BackupDescriptor, BackupOutcome, Location, SegmentRecord},
    services::{
        object_store::{ObjectBody, ObjectHeaders, ObjectStore, manifest_headers, strip_etag_quotes},
        runner::{BackupReader, BackupRunner, RunnerError},
        segmenting_reader::SegmentingReader,
    },
};
use md5::Context;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

pub const SUCCESS_NOTE: &str = "Successfully saved data to Swift!";
pub const FAILURE_NOTE: &str = "Error saving data to Swift!";

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_SEGMENT_MAX_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Segments uploaded so far, kept on failure for the outcome.
struct Upload {
    segments: Vec<SegmentRecord>,
    whole_checksum: Context,
}

#[derive(Clone)]
pub struct BackupService {
    store: Arc<dyn ObjectStore>,
    chunk_size: usize,
    segment_max_size: u64,
}

impl BackupService {
    pub fn new(store: Arc<dyn ObjectStore>, chunk_size: usize, segment_max_size: u64) -> Self {
        Self {
            store,
            chunk_size,
            segment_max_size,
        }
    }

    /// Run `runner` and store its output under `container`.
    ///
    /// Never panics or returns early: every failure is folded into a
    /// `BackupOutcome` with `success = false`, a note, and the typed error.
    /// The manifest is written only when every segment verified and the
    /// runner reported success, so a failed backup never leaves a
    /// consumable manifest. Segments already uploaded are left in place.
    pub async fn save(&self, container: &str, runner: &mut dyn BackupRunner) -> BackupOutcome {
        let descriptor = BackupDescriptor::for_manifest(
            runner.manifest_name(),
            container,
            self.chunk_size,
            self.segment_max_size,
        );
        let location = Location::new(
            self.store.storage_url(),
            container,
            descriptor.manifest_name.clone(),
        )
        .to_string();
        info!("saving backup to {}", location);

        let mut upload = Upload {
            segments: Vec::new(),
            whole_checksum: Context::new(),
        };
        match self.run(&descriptor, runner, &mut upload).await {
            Ok(checksum) => {
                info!(
                    "backup {} stored in {} segments, checksum {}",
                    location,
                    upload.segments.len(),
                    checksum
                );
                BackupOutcome::succeeded(SUCCESS_NOTE, checksum, location, upload.segments)
            }
            Err(err) => {
                error!("backup {} failed: {}", location, err);
                BackupOutcome::failed(
                    format!("{FAILURE_NOTE} {err}"),
                    Some(location),
                    upload.segments,
                    err,
                )
            }
        }
    }

    async fn run(
        &self,
        descriptor: &BackupDescriptor,
        runner: &mut dyn BackupRunner,
        upload: &mut Upload,
    ) -> Result<String, PipelineError> {
        self.store.put_container(&descriptor.container).await?;

        let stream = match runner.open().await {
            Ok(stream) => stream,
            Err(err) => {
                runner.abort().await;
                return Err(PipelineError::RunnerFailed(err));
            }
        };

        if let Err(err) = self.upload_segments(descriptor, stream, upload).await {
            runner.abort().await;
            return Err(err);
        }

        runner.close().await.map_err(PipelineError::RunnerFailed)?;
        if !runner.successful() {
            return Err(PipelineError::RunnerFailed(RunnerError::Incomplete(
                descriptor.manifest_name.clone(),
            )));
        }

        let local = format!("{:x}", upload.whole_checksum.clone().compute());
        self.write_manifest(descriptor, runner, &local).await?;
        Ok(local)
    }

    /// PUT one segment after another until the runner stream is exhausted.
    async fn upload_segments(
        &self,
        descriptor: &BackupDescriptor,
        stream: BackupReader,
        upload: &mut Upload,
    ) -> Result<(), PipelineError> {
        let reader = SegmentingReader::new(stream, descriptor.clone())?;
        let reader = Arc::new(Mutex::new(reader));

        loop {
            let (index, name) = {
                let reader = reader.lock().await;
                if reader.end_of_file() {
                    break;
                }
                (reader.segment_index(), reader.current_segment_name())
            };

            let body = SegmentingReader::segment_body(reader.clone());
            let etag = self
                .store
                .put_object(
                    &descriptor.container,
                    &name,
                    ObjectBody::Stream(body),
                    ObjectHeaders::new(),
                )
                .await?;

            let (length, checksum) = {
                let reader = reader.lock().await;
                (reader.segment_length(), reader.segment_checksum_hex())
            };
            let etag = strip_etag_quotes(&etag).to_string();
            if etag != checksum {
                error!(
                    "segment {} etag {} does not match checksum {}",
                    name, etag, checksum
                );
                return Err(PipelineError::SegmentEtagMismatch {
                    segment: name,
                    etag,
                    checksum,
                });
            }

            debug!("segment {} stored ({} bytes, {})", name, length, checksum);
            // The manifest ETag is computed over hex digests, not raw ones.
            upload.whole_checksum.consume(checksum.as_bytes());
            upload.segments.push(SegmentRecord {
                index,
                object_name: name,
                length,
                checksum,
                etag,
            });
        }
        Ok(())
    }

    /// Write the zero-length manifest and compare the ETag the store computes
    /// for it with the local whole-object checksum.
    async fn write_manifest(
        &self,
        descriptor: &BackupDescriptor,
        runner: &dyn BackupRunner,
        local: &str,
    ) -> Result<(), PipelineError> {
        let mut headers = manifest_headers(&descriptor.prefix());
        runner.metadata().write_headers(&mut headers);

        // The PUT ETag is the digest of the empty body and says nothing
        // about the segments.
        self.store
            .put_object(
                &descriptor.container,
                &descriptor.manifest_name,
                ObjectBody::empty(),
                headers,
            )
            .await?;

        let info = self
            .store
            .head_object(&descriptor.container, &descriptor.manifest_name)
            .await?;
        let remote = strip_etag_quotes(&info.etag);
        if remote != local {
            error!(
                "manifest {} etag {} does not match checksum {}",
                descriptor.manifest_name, remote, local
            );
            return Err(PipelineError::ManifestEtagMismatch {
                manifest: descriptor.manifest_name.clone(),
                etag: remote.to_string(),
                checksum: local.to_string(),
            });
        }
        Ok(())
    }
}
