//! Where the data of an upload comes from, and how it is cut into chunks.
use crate::planner::{self, ChunkDescriptor};
use crate::Result;
use bytes::{Bytes, BytesMut};
use snafu::prelude::*;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// How much the buffer for a reader chunk grows by at a time.  Chunks can be up to 5 GiB, which
/// mustn't be allocated before the reader has shown it has that much data.
const READ_BUFFER_INCREMENT: usize = 1024 * 1024;

/// The data to upload as an object
pub enum UploadSource {
    /// Data that is already in memory
    Bytes(Bytes),

    /// A file on the local filesystem.  Its size is determined when the job is built, and each
    /// chunk is read from the file just before it is uploaded.
    File(PathBuf),

    /// Some arbitrary [`tokio::io::AsyncRead`] impl whose length isn't known in advance.
    ///
    /// The data are read sequentially one chunk at a time, so there is never more than one chunk in
    /// memory.  Because the number of parts isn't known, each URL request asks for the maximum
    /// batch size.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Reader(_) => f
                .debug_tuple("Reader")
                .field(&"dyn AsyncRead".to_string())
                .finish(),
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl UploadSource {
    /// Prepare to read the source in chunks of `chunk_size`.  For files this opens the file and
    /// determines its size.
    pub(crate) async fn into_chunks(self, key: &str, chunk_size: u64) -> Result<SourceChunks> {
        let data = match self {
            Self::Bytes(bytes) => {
                let total_size = bytes.len() as u64;
                SourceData::Sized {
                    chunks: planner::plan_chunks(total_size, chunk_size).into_iter(),
                    total_size,
                    data: SizedData::Bytes(bytes),
                }
            }
            Self::File(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|_| crate::error::OpenSourceSnafu { path: path.clone() })?;
                let total_size = file
                    .metadata()
                    .await
                    .with_context(|_| crate::error::OpenSourceSnafu { path: path.clone() })?
                    .len();

                debug!(path = %path.display(), total_size, "Opened upload source file");

                SourceData::Sized {
                    chunks: planner::plan_chunks(total_size, chunk_size).into_iter(),
                    total_size,
                    data: SizedData::File(file),
                }
            }
            Self::Reader(reader) => SourceData::Unsized {
                reader,
                next_index: 0,
                next_offset: 0,
                finished: false,
            },
        };

        Ok(SourceChunks {
            key: key.to_string(),
            chunk_size,
            data,
        })
    }
}

/// An upload source that has been opened and is yielding its data one chunk at a time, in order
pub(crate) struct SourceChunks {
    key: String,
    chunk_size: u64,
    data: SourceData,
}

enum SourceData {
    Sized {
        chunks: std::vec::IntoIter<ChunkDescriptor>,
        total_size: u64,
        data: SizedData,
    },
    Unsized {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        next_index: usize,
        next_offset: u64,
        finished: bool,
    },
}

enum SizedData {
    Bytes(Bytes),
    File(tokio::fs::File),
}

impl SourceChunks {
    /// The size of the whole object, if it's known before reading all of the data
    pub(crate) fn total_size(&self) -> Option<u64> {
        match &self.data {
            SourceData::Sized { total_size, .. } => Some(*total_size),
            SourceData::Unsized { .. } => None,
        }
    }

    pub(crate) fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// The number of chunks the object is split into, if the size is known
    pub(crate) fn total_chunks(&self) -> Option<usize> {
        self.total_size()
            .map(|total_size| planner::chunk_count(total_size, self.chunk_size))
    }

    /// Read the next chunk, or `None` if all of the data has been read.
    ///
    /// There is always at least one chunk, even if the source has no data at all.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<(ChunkDescriptor, Bytes)>> {
        match &mut self.data {
            SourceData::Sized { chunks, data, .. } => {
                let Some(chunk) = chunks.next() else {
                    return Ok(None);
                };

                let bytes = match data {
                    SizedData::Bytes(bytes) => {
                        bytes.slice(chunk.byte_range.start as usize..chunk.byte_range.end as usize)
                    }
                    SizedData::File(file) => {
                        let mut buffer = vec![0u8; chunk.len() as usize];

                        file.seek(std::io::SeekFrom::Start(chunk.byte_range.start))
                            .await
                            .with_context(|_| crate::error::ReadSourceSnafu {
                                key: self.key.clone(),
                                part_number: chunk.part_number(),
                            })?;
                        file.read_exact(&mut buffer).await.with_context(|_| {
                            crate::error::ReadSourceSnafu {
                                key: self.key.clone(),
                                part_number: chunk.part_number(),
                            }
                        })?;

                        Bytes::from(buffer)
                    }
                };

                Ok(Some((chunk, bytes)))
            }
            SourceData::Unsized {
                reader,
                next_index,
                next_offset,
                finished,
            } => {
                if *finished {
                    return Ok(None);
                }

                let chunk_size = self.chunk_size as usize;
                let mut buffer = BytesMut::new();

                // Read until the buffer is full, or until a 0 byte read indicates the end of the
                // data
                while buffer.len() < chunk_size {
                    if buffer.len() == buffer.capacity() {
                        buffer.reserve(READ_BUFFER_INCREMENT.min(chunk_size - buffer.len()));
                    }

                    let bytes_read = (&mut *reader)
                        .take((chunk_size - buffer.len()) as u64)
                        .read_buf(&mut buffer)
                        .await
                        .with_context(|_| crate::error::ReadSourceSnafu {
                            key: self.key.clone(),
                            part_number: *next_index + 1,
                        })?;

                    if bytes_read == 0 {
                        *finished = true;
                        break;
                    }
                }

                if buffer.is_empty() && *next_index > 0 {
                    // The data ended exactly on a chunk boundary, the previous chunk was the last
                    debug!(chunks = *next_index, "Upload source reader is exhausted");
                    return Ok(None);
                }

                let chunk = ChunkDescriptor {
                    index: *next_index,
                    byte_range: *next_offset..(*next_offset + buffer.len() as u64),
                };

                *next_index += 1;
                *next_offset = chunk.byte_range.end;

                Ok(Some((chunk, buffer.freeze())))
            }
        }
    }
}
