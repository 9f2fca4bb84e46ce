//! src/services/segmenting_reader.rs
//!
//! Splits an unbounded backup stream into size-bounded segments while
//! tracking each segment's length and MD5. Segments are handed to the object
//! store one at a time through [`SegmentingReader::segment_body`], a stream
//! that ends exactly where the current segment ends.

use crate::models::backup::BackupDescriptor;
use crate::services::object_store::ByteStream;
use bytes::Bytes;
use futures::StreamExt;
use md5::Context;
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::Mutex,
};

pub struct SegmentingReader<R> {
    stream: R,
    descriptor: BackupDescriptor,
    segment_length: u64,
    segment_checksum: Context,
    segment_index: u32,
    end_of_file: bool,
    end_of_segment: bool,
    /// Chunk read past a full segment to learn whether the stream continues.
    lookahead: Option<Bytes>,
    total_length: u64,
}

impl<R> SegmentingReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R, descriptor: BackupDescriptor) -> io::Result<Self> {
        if descriptor.chunk_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk size must be positive",
            ));
        }
        if descriptor.chunk_size as u64 > descriptor.segment_max_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "chunk size {} exceeds segment cap {}",
                    descriptor.chunk_size, descriptor.segment_max_size
                ),
            ));
        }
        Ok(Self {
            stream,
            descriptor,
            segment_length: 0,
            segment_checksum: Context::new(),
            segment_index: 0,
            end_of_file: false,
            end_of_segment: false,
            lookahead: None,
            total_length: 0,
        })
    }

    /// Return the next chunk of the current segment.
    ///
    /// An empty chunk means the current segment is closed: either the next
    /// chunk would push it past the cap (`end_of_segment`, index advanced)
    /// or the underlying stream is exhausted (`end_of_file`). A full segment
    /// only opens a successor once at least one more byte is known to exist,
    /// so a stream ending on a segment boundary leaves no empty tail segment.
    pub async fn read(&mut self) -> io::Result<Bytes> {
        if self.end_of_segment {
            self.segment_length = 0;
            self.segment_checksum = Context::new();
            self.end_of_segment = false;
        }
        if self.end_of_file {
            return Ok(Bytes::new());
        }

        if self.segment_length + self.descriptor.chunk_size as u64 > self.descriptor.segment_max_size
        {
            if self.lookahead.is_none() {
                let chunk = self.fill_chunk().await?;
                if chunk.is_empty() {
                    self.end_of_file = true;
                    return Ok(Bytes::new());
                }
                self.lookahead = Some(chunk);
            }
            self.end_of_segment = true;
            self.segment_index += 1;
            return Ok(Bytes::new());
        }

        let chunk = match self.lookahead.take() {
            Some(chunk) => chunk,
            None => self.fill_chunk().await?,
        };
        if chunk.is_empty() {
            self.end_of_file = true;
            return Ok(Bytes::new());
        }

        self.segment_checksum.consume(&chunk);
        self.segment_length += chunk.len() as u64;
        self.total_length += chunk.len() as u64;
        Ok(chunk)
    }

    /// Read up to one chunk, looping over short reads from pipes.
    async fn fill_chunk(&mut self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; self.descriptor.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    pub fn end_of_file(&self) -> bool {
        self.end_of_file
    }

    pub fn end_of_segment(&self) -> bool {
        self.end_of_segment
    }

    pub fn segment_index(&self) -> u32 {
        self.segment_index
    }

    pub fn segment_length(&self) -> u64 {
        self.segment_length
    }

    /// Bytes handed out across all segments so far.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Hex MD5 of the bytes read into the current (or just closed) segment.
    pub fn segment_checksum_hex(&self) -> String {
        format!("{:x}", self.segment_checksum.clone().compute())
    }

    pub fn base_filename(&self) -> &str {
        &self.descriptor.base_filename
    }

    pub fn segment_name(&self, index: u32) -> String {
        self.descriptor.segment_name(index)
    }

    pub fn current_segment_name(&self) -> String {
        self.descriptor.segment_name(self.segment_index)
    }

    pub fn prefix(&self) -> String {
        self.descriptor.prefix()
    }
}

impl<R> SegmentingReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Body for one segment PUT: yields chunks until `read` returns empty.
    ///
    /// The reader is shared so the caller can inspect the closed segment's
    /// checksum once the store has consumed the body.
    pub fn segment_body(reader: Arc<Mutex<Self>>) -> ByteStream {
        futures::stream::try_unfold(reader, |reader| async move {
            let chunk = reader.lock().await.read().await?;
            if chunk.is_empty() {
                Ok::<_, io::Error>(None)
            } else {
                Ok(Some((chunk, reader)))
            }
        })
        .boxed()
    }
}
