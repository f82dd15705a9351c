//! Uploading one chunk, retrying failed attempts up to the configured limit.
use crate::error::PartFailure;
use crate::http::HttpTransport;
use crate::part::{self, PartOutcome};
use crate::planner::ChunkDescriptor;
use crate::pool::SignedUrlPool;
use crate::{OssDirectError, UploadProgressCallback};
use bytes::Bytes;
use snafu::IntoError;
use tracing::{debug, error, instrument, warn};

/// How the upload of a chunk ended
#[derive(Debug)]
pub(crate) enum ChunkOutcome {
    /// The chunk was uploaded, after this many attempts
    Done { attempts: usize },

    /// The chunk couldn't be uploaded, and neither can the object
    Aborted(OssDirectError),
}

/// Uploads chunks through a [`SignedUrlPool`], each attempt with a fresh URL.
///
/// Every attempt counts against `max_retry`, no matter how it fails.  A 403 means the URLs in the
/// pool are stale (they expire together), so the whole pool is discarded before the next attempt.
#[derive(Debug)]
pub(crate) struct RetryController<'a> {
    pub transport: &'a dyn HttpTransport,
    pub bucket: &'a str,
    pub key: &'a str,
    pub max_retry: usize,
}

impl RetryController<'_> {
    #[instrument(skip_all, fields(part_number = chunk.part_number(), chunk_size = chunk.len()))]
    pub async fn upload_chunk(
        &self,
        pool: &mut SignedUrlPool,
        chunk: &ChunkDescriptor,
        data: &Bytes,
        progress: &dyn UploadProgressCallback,
    ) -> ChunkOutcome {
        let part_number = chunk.part_number();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let (url, issued) = match pool.take(chunk.index).await {
                Ok(taken) => taken,
                Err(e) => {
                    error!(err = ?e, "Unable to get a signed URL for the part");
                    return ChunkOutcome::Aborted(e);
                }
            };
            if let Some(count) = issued {
                progress.upload_urls_issued(self.bucket, self.key, part_number, count);
            }

            let failure = match part::upload_part(self.transport, url, data.clone()).await {
                PartOutcome::Success => {
                    debug!(attempts, "Part uploaded");
                    return ChunkOutcome::Done { attempts };
                }
                PartOutcome::StaleUrl => {
                    pool.clear();
                    PartFailure::StaleUrl
                }
                PartOutcome::Failure(failure) => failure,
            };

            progress.part_attempt_failed(self.bucket, self.key, part_number, attempts, &failure);

            if attempts >= self.max_retry {
                error!(attempts, last_failure = %failure, "Giving up on the part");

                return ChunkOutcome::Aborted(
                    crate::error::RetryExhaustedSnafu {
                        bucket: self.bucket,
                        key: self.key,
                        part_number,
                        attempts,
                    }
                    .into_error(failure),
                );
            }

            warn!(
                attempts,
                max_retry = self.max_retry,
                failure = %failure,
                "Part upload attempt failed; retrying with a new URL"
            );
        }
    }
}
