//! Implementation of the operation which downloads an object through a signed URL.
use crate::api::{DownloadUrl, ObjectStoreApi};
use crate::credentials::{AccessTokenProvider, SharedTokenProvider};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::{Config, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use snafu::prelude::*;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

/// Never reserve more memory than this up front for an in-memory download
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Represents where the downloaded object data are written
pub enum DownloadTarget {
    /// Write the object to a file on the local filesystem, replacing it if it exists.
    ///
    /// The data are written to a temporary file in the same directory, which is renamed to the
    /// target path only once the whole object has been received.  If the download fails or is
    /// aborted the temporary file is removed and whatever was at the target path is untouched.
    /// Like any [`tempfile::NamedTempFile`], the new file is readable only by its owner.
    File(PathBuf),

    /// Write the object to some arbitrary [`tokio::io::AsyncWrite`] impl.
    Writer(Box<dyn AsyncWrite + Send + Unpin>),

    /// Collect the object in memory, and return it in [`DownloadedObject::data`]
    Memory,
}

impl std::fmt::Debug for DownloadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Writer(_) => f
                .debug_tuple("Writer")
                .field(&"dyn AsyncWrite".to_string())
                .finish(),
            Self::Memory => f.write_str("Memory"),
        }
    }
}

/// A trait which callers can implement to get progress updates as a download is progressing.
#[allow(unused_variables)]
pub trait DownloadProgressCallback: Sync + Send {
    /// The object is ready and its data are about to be received.  The size is known if the
    /// object store reported it.
    fn download_starting(&self, bucket: &str, key: &str, total_bytes: Option<u64>) {}

    /// Some bytes of the object have been received and written to the target
    fn download_bytes_received(&self, bucket: &str, key: &str, bytes: usize) {}

    /// The entire object has been received and written to the target
    fn download_completed(&self, bucket: &str, key: &str, total_bytes: u64) {}
}

/// What a completed download produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadedObject {
    /// Bytes received
    pub size: u64,

    /// The object data, for [`DownloadTarget::Memory`] only
    pub data: Option<Bytes>,
}

#[derive(Debug)]
pub struct DownloadJobBuilder {
    config: Config,
    token_provider: SharedTokenProvider,
    transport: Box<dyn HttpTransport>,
    bucket: String,
    key: String,
    target: DownloadTarget,
}

impl DownloadJobBuilder {
    pub fn new(
        config: Config,
        token_provider: impl AccessTokenProvider + 'static,
        bucket: impl Into<String>,
        key: impl Into<String>,
        target: DownloadTarget,
    ) -> Self {
        Self {
            config,
            token_provider: Arc::new(token_provider),
            transport: Box::new(ReqwestTransport::default()),
            bucket: bucket.into(),
            key: key.into(),
            target,
        }
    }

    /// Send requests through a different HTTP transport than the default `reqwest` client
    pub fn transport(&mut self, transport: impl HttpTransport) {
        self.transport = Box::new(transport);
    }

    pub fn build(self) -> Result<DownloadJob> {
        self.config.validate()?;

        Ok(DownloadJob {
            api: ObjectStoreApi::new(self.config, self.transport, self.token_provider),
            bucket: self.bucket,
            key: self.key,
            target: self.target,
        })
    }
}

/// A job which will download an object from the object store.
///
/// There's no multipart download; the whole object is requested with one signed URL.  If the
/// object isn't ready to be downloaded the job fails right away, it doesn't wait for the object
/// to become ready.
#[derive(Debug)]
pub struct DownloadJob {
    api: ObjectStoreApi,
    bucket: String,
    key: String,
    target: DownloadTarget,
}

/// Where the job is writing received data
enum Sink {
    /// A temporary file, renamed to `path` when the download is complete
    File {
        path: PathBuf,
        temp: tempfile::NamedTempFile,
        file: tokio::fs::File,
    },
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    Memory(BytesMut),
}

impl DownloadJob {
    /// Alternative to [`Self::run`] which doesn't require a [`DownloadProgressCallback`]
    /// implementation, for callers that do not care about progress information.
    pub async fn run_without_progress(
        self,
        abort: impl Future<Output = ()>,
    ) -> Result<DownloadedObject> {
        struct NoProgress {}
        impl DownloadProgressCallback for NoProgress {}

        self.run(abort, NoProgress {}).await
    }

    /// Run the job, returning only when the object has been downloaded (or the download failed).
    ///
    /// If the `abort` future is completed, it's a signal that the job should be aborted.  The
    /// download is abandoned and this method returns an abort error.  Whatever was already
    /// written to a writer target stays there; a file target is left as it was.
    pub async fn run<Abort, Progress>(
        self,
        abort: Abort,
        progress: Progress,
    ) -> Result<DownloadedObject>
    where
        Abort: Future<Output = ()>,
        Progress: DownloadProgressCallback + 'static,
    {
        let bucket = self.bucket.clone();
        let key = self.key.clone();

        tokio::select! {
            biased;

            _ = abort => {
                debug!(%bucket, %key, "Download aborted");
                crate::error::AbortedSnafu.fail()
            }
            result = self.run_internal(&progress) => result,
        }
    }

    #[instrument(skip_all, fields(bucket = %self.bucket, key = %self.key))]
    async fn run_internal(
        self,
        progress: &dyn DownloadProgressCallback,
    ) -> Result<DownloadedObject> {
        let Self {
            api,
            bucket,
            key,
            target,
        } = self;

        let (url, size) = match api.issue_download_url(&bucket, &key).await? {
            DownloadUrl::Ready { url, size } => (url, size),
            DownloadUrl::NotReady { status } => {
                return crate::error::ObjectNotReadySnafu {
                    bucket,
                    key,
                    status,
                }
                .fail();
            }
        };

        let response = crate::part::download_object(api.transport(), url)
            .await
            .with_context(|_| crate::error::DownloadObjectSnafu {
                bucket: bucket.clone(),
                key: key.clone(),
            })?;

        let total_bytes = response.content_length().or(size);
        debug!(?total_bytes, "Receiving object data");
        progress.download_starting(&bucket, &key, total_bytes);

        let mut sink = match target {
            DownloadTarget::File(path) => {
                let dir = match path.parent() {
                    Some(dir) if !dir.as_os_str().is_empty() => dir,
                    _ => std::path::Path::new("."),
                };
                let temp = tempfile::Builder::new()
                    .prefix(".ossdirect-download-")
                    .tempfile_in(dir)
                    .with_context(|_| crate::error::CreateTargetSnafu { path: path.clone() })?;
                let file = temp
                    .as_file()
                    .try_clone()
                    .with_context(|_| crate::error::CreateTargetSnafu { path: path.clone() })?;

                Sink::File {
                    path,
                    temp,
                    file: tokio::fs::File::from_std(file),
                }
            }
            DownloadTarget::Writer(writer) => Sink::Writer(writer),
            DownloadTarget::Memory => Sink::Memory(BytesMut::with_capacity(
                total_bytes.unwrap_or(0).min(MAX_PREALLOCATION) as usize,
            )),
        };

        let mut received = 0u64;
        let mut body = response.body;

        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .context(crate::error::PartTransportSnafu)
                .with_context(|_| crate::error::DownloadObjectSnafu {
                    bucket: bucket.clone(),
                    key: key.clone(),
                })?;

            match &mut sink {
                Sink::File { file, .. } => file
                    .write_all(&chunk)
                    .await
                    .with_context(|_| crate::error::WriteTargetSnafu { key: key.clone() })?,
                Sink::Writer(writer) => writer
                    .write_all(&chunk)
                    .await
                    .with_context(|_| crate::error::WriteTargetSnafu { key: key.clone() })?,
                Sink::Memory(buffer) => buffer.extend_from_slice(&chunk),
            }

            received += chunk.len() as u64;
            progress.download_bytes_received(&bucket, &key, chunk.len());
        }

        let data = match sink {
            Sink::File {
                path,
                temp,
                mut file,
            } => {
                file.flush()
                    .await
                    .with_context(|_| crate::error::WriteTargetSnafu { key: key.clone() })?;
                drop(file);

                debug!(path = %path.display(), "Moving downloaded data into place");
                temp.persist(&path)
                    .map_err(|e| e.error)
                    .context(crate::error::CreateTargetSnafu { path })?;

                None
            }
            Sink::Writer(mut writer) => {
                writer
                    .shutdown()
                    .await
                    .with_context(|_| crate::error::WriteTargetSnafu { key: key.clone() })?;

                None
            }
            Sink::Memory(buffer) => Some(buffer.freeze()),
        };

        debug!(received, "Download completed");
        progress.download_completed(&bucket, &key, received);

        Ok(DownloadedObject {
            size: received,
            data,
        })
    }
}
