//! Implementation of the operation which uploads an object in parts through signed URLs.
use crate::api::{ObjectDetails, ObjectStoreApi};
use crate::config::MAX_PARTS;
use crate::credentials::{AccessTokenProvider, SharedTokenProvider};
use crate::error::PartFailure;
use crate::finalize::CompletionFinalizer;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::pool::SignedUrlPool;
use crate::retry::{ChunkOutcome, RetryController};
use crate::source::{SourceChunks, UploadSource};
use crate::{Config, Result};
use http::HeaderValue;
use snafu::prelude::*;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A trait which callers can implement to get detailed progress updates as an upload is
/// progressing.
#[allow(unused_variables)]
pub trait UploadProgressCallback: Sync + Send {
    /// The upload is about to start.  The size and number of parts aren't known if the data comes
    /// from a reader.
    fn upload_starting(
        &self,
        bucket: &str,
        key: &str,
        total_bytes: Option<u64>,
        total_parts: Option<usize>,
    ) {
    }

    /// A batch of `count` signed URLs was issued, starting with the URL for `first_part`
    fn upload_urls_issued(&self, bucket: &str, key: &str, first_part: usize, count: usize) {}

    /// An attempt to upload a part failed.  If `attempt` is less than the retry limit the part is
    /// about to be tried again.
    fn part_attempt_failed(
        &self,
        bucket: &str,
        key: &str,
        part_number: usize,
        attempt: usize,
        failure: &PartFailure,
    ) {
    }

    /// A part was uploaded successfully
    fn part_uploaded(&self, bucket: &str, key: &str, part_number: usize, part_size: usize) {}

    /// All parts are uploaded, and the upload is about to be completed
    fn upload_finalizing(&self, bucket: &str, key: &str, total_parts: usize, total_bytes: u64) {}

    /// The object has been assembled from its parts and is now in the object store
    fn upload_completed(&self, bucket: &str, key: &str, details: &ObjectDetails) {}
}

/// The states an upload goes through.  Every upload ends either `Complete` or `Aborted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
    Planning,
    Transferring,
    Finalizing,
    Complete,
    Aborted,
}

impl SessionState {
    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Planning, Transferring)
                | (Transferring, Finalizing)
                | (Finalizing, Complete)
                | (Planning | Transferring | Finalizing, Aborted)
        )
    }

    fn transition(&mut self, next: SessionState) {
        assert!(
            self.can_become(next),
            "BUG: invalid upload state transition from {self:?} to {next:?}"
        );

        debug!(from = ?*self, to = ?next, "Upload state changed");
        *self = next;
    }
}

#[derive(Debug)]
pub struct UploadJobBuilder {
    config: Config,
    token_provider: SharedTokenProvider,
    transport: Box<dyn HttpTransport>,
    bucket: String,
    key: String,
    source: UploadSource,
    content_type: Option<String>,
}

impl UploadJobBuilder {
    /// Initialize a new upload job builder, to upload the data from `source` to object `key` in
    /// `bucket`.
    ///
    /// The object is created if it doesn't exist, or replaced if it does, but only once the whole
    /// upload succeeds.
    pub fn new(
        config: Config,
        token_provider: impl AccessTokenProvider + 'static,
        bucket: impl Into<String>,
        key: impl Into<String>,
        source: impl Into<UploadSource>,
    ) -> Self {
        Self {
            config,
            token_provider: Arc::new(token_provider),
            transport: Box::new(ReqwestTransport::default()),
            bucket: bucket.into(),
            key: key.into(),
            source: source.into(),
            content_type: None,
        }
    }

    /// Record a content type (MIME type) with the object when the upload is completed
    pub fn content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// Send requests through a different HTTP transport than the default `reqwest` client
    pub fn transport(&mut self, transport: impl HttpTransport) {
        self.transport = Box::new(transport);
    }

    /// Validate the job, and prepare the source data for reading.
    ///
    /// No requests are made to the object store until the job is run.
    #[instrument(err, skip(self), fields(bucket = %self.bucket, key = %self.key))]
    pub async fn build(self) -> Result<UploadJob> {
        self.config.validate()?;

        let content_type = self
            .content_type
            .map(|content_type| {
                HeaderValue::from_str(&content_type)
                    .ok()
                    .with_context(|| crate::error::InvalidConfigSnafu {
                        message: format!("'{content_type}' is not a valid content type"),
                    })
            })
            .transpose()?;

        let chunk_size = self.config.chunk_size_bytes();
        let chunks = self.source.into_chunks(&self.key, chunk_size).await?;

        if let (Some(size), Some(parts)) = (chunks.total_size(), chunks.total_chunks()) {
            ensure!(
                parts <= MAX_PARTS,
                crate::error::TooManyPartsSnafu {
                    key: self.key.clone(),
                    size,
                    chunk_size,
                    parts,
                    max_parts: MAX_PARTS,
                }
            );
        }

        debug!(
            total_bytes = ?chunks.total_size(),
            total_parts = ?chunks.total_chunks(),
            chunk_size,
            "Upload job is ready"
        );

        Ok(UploadJob {
            max_batch_size: self.config.max_batch_size,
            max_retry: self.config.max_retry,
            api: ObjectStoreApi::new(self.config, self.transport, self.token_provider),
            bucket: self.bucket,
            key: self.key,
            content_type,
            chunks,
        })
    }
}

/// A job which will upload an object to the object store.
///
/// The parts are uploaded one at a time, in order.  Only after all of them are uploaded is the
/// upload completed, which is when the object appears in the object store.
pub struct UploadJob {
    api: ObjectStoreApi,
    bucket: String,
    key: String,
    content_type: Option<HeaderValue>,
    chunks: SourceChunks,
    max_batch_size: usize,
    max_retry: usize,
}

impl std::fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadJob")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("content_type", &self.content_type)
            .field("total_bytes", &self.total_bytes())
            .field("total_parts", &self.total_parts())
            .finish()
    }
}

impl UploadJob {
    /// The total number of bytes to upload, if known.  It's not known when uploading from a
    /// reader.
    pub fn total_bytes(&self) -> Option<u64> {
        self.chunks.total_size()
    }

    /// The number of parts the object is uploaded in, if known
    pub fn total_parts(&self) -> Option<usize> {
        self.chunks.total_chunks()
    }

    /// Alternative to [`Self::run`] which doesn't require a [`UploadProgressCallback`]
    /// implementation, for callers that do not care about progress information.
    pub async fn run_without_progress(
        self,
        abort: impl Future<Output = ()>,
    ) -> Result<ObjectDetails> {
        // A dummy impl of UploadProgressCallback that doesn't do anything with any of the progress
        // updates
        struct NoProgress {}
        impl UploadProgressCallback for NoProgress {}

        self.run(abort, NoProgress {}).await
    }

    /// Run the job, returning the details of the new object when the upload has run to completion
    /// (or failed).
    ///
    /// If the `abort` future is completed, it's a signal that the job should be aborted.  The
    /// in-progress request is abandoned, the upload is never completed, and this method returns an
    /// abort error.
    pub async fn run<Abort, Progress>(self, abort: Abort, progress: Progress) -> Result<ObjectDetails>
    where
        Abort: Future<Output = ()>,
        Progress: UploadProgressCallback + 'static,
    {
        let bucket = self.bucket.clone();
        let key = self.key.clone();

        tokio::select! {
            biased;

            _ = abort => {
                debug!(%bucket, %key, "Upload aborted");
                crate::error::AbortedSnafu.fail()
            }
            result = self.run_internal(&progress) => result,
        }
    }

    #[instrument(skip_all, fields(bucket = %self.bucket, key = %self.key))]
    async fn run_internal(self, progress: &dyn UploadProgressCallback) -> Result<ObjectDetails> {
        let Self {
            api,
            bucket,
            key,
            content_type,
            mut chunks,
            max_batch_size,
            max_retry,
        } = self;

        let mut state = SessionState::Planning;
        let total_parts = chunks.total_chunks();

        progress.upload_starting(&bucket, &key, chunks.total_size(), total_parts);

        let mut pool = SignedUrlPool::new(api.clone(), &bucket, &key, max_batch_size, total_parts);
        let retry = RetryController {
            transport: api.transport(),
            bucket: &bucket,
            key: &key,
            max_retry,
        };

        state.transition(SessionState::Transferring);

        let mut parts_uploaded = 0usize;
        let mut bytes_uploaded = 0u64;
        // Parts that needed more than one attempt
        let mut parts_retried = 0usize;

        loop {
            let (chunk, data) = match chunks.next_chunk().await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    state.transition(SessionState::Aborted);
                    return Err(e);
                }
            };

            if chunk.index >= MAX_PARTS {
                // Only possible with a reader, otherwise the job wouldn't have been built
                state.transition(SessionState::Aborted);
                return crate::error::TooManyPartsSnafu {
                    key: key.clone(),
                    size: chunk.byte_range.end,
                    chunk_size: chunks.chunk_size(),
                    parts: chunk.part_number(),
                    max_parts: MAX_PARTS,
                }
                .fail();
            }

            match retry
                .upload_chunk(&mut pool, &chunk, &data, progress)
                .await
            {
                ChunkOutcome::Done { attempts } => {
                    if attempts > 1 {
                        parts_retried += 1;
                    }
                    parts_uploaded += 1;
                    bytes_uploaded += chunk.len();

                    progress.part_uploaded(&bucket, &key, chunk.part_number(), data.len());
                }
                ChunkOutcome::Aborted(e) => {
                    state.transition(SessionState::Aborted);
                    return Err(e);
                }
            }
        }

        state.transition(SessionState::Finalizing);

        debug!(
            parts_uploaded,
            bytes_uploaded, parts_retried, "All parts uploaded; completing the upload"
        );
        progress.upload_finalizing(&bucket, &key, parts_uploaded, bytes_uploaded);

        let upload_key = pool
            .upload_key()
            .expect("BUG: there is always at least one part, so a URL batch was issued")
            .to_string();

        let finalizer = CompletionFinalizer {
            api: &api,
            bucket: &bucket,
            key: &key,
            content_type: content_type.as_ref(),
        };

        match finalizer.finalize(&upload_key, parts_uploaded).await {
            Ok(details) => {
                state.transition(SessionState::Complete);
                progress.upload_completed(&bucket, &key, &details);

                Ok(details)
            }
            Err(e) => {
                state.transition(SessionState::Aborted);

                Err(e)
            }
        }
    }
}
