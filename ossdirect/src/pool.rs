//! The signed upload URLs that have been issued for an upload but not used yet.
use crate::api::{ObjectStoreApi, UrlBatch};
use crate::config::MAX_PARTS;
use crate::Result;
use std::collections::VecDeque;
use tracing::{debug, warn};
use url::Url;

/// Holds the unused signed URLs of one upload along with its upload key, and requests more URLs
/// from the object store when they run out.
///
/// Every URL can be used only once, and only for the part it was issued for.  URLs are removed
/// from the pool when they are taken, whether or not the transfer they're used for succeeds.
#[derive(Debug)]
pub(crate) struct SignedUrlPool {
    api: ObjectStoreApi,
    bucket: String,
    key: String,
    max_batch_size: usize,

    /// The number of parts in the upload, if it's known up front
    total_parts: Option<usize>,

    /// Unused URLs, each tagged with the 0-based index of the chunk it's for, in ascending order
    urls: VecDeque<(usize, Url)>,

    /// Assigned by the object store with the first batch of URLs and the same for the rest of the
    /// upload
    upload_key: Option<String>,
}

impl SignedUrlPool {
    pub fn new(
        api: ObjectStoreApi,
        bucket: impl Into<String>,
        key: impl Into<String>,
        max_batch_size: usize,
        total_parts: Option<usize>,
    ) -> Self {
        Self {
            api,
            bucket: bucket.into(),
            key: key.into(),
            max_batch_size,
            total_parts,
            urls: VecDeque::new(),
            upload_key: None,
        }
    }

    /// The key identifying this upload, once the first URL batch has been issued
    pub fn upload_key(&self) -> Option<&str> {
        self.upload_key.as_deref()
    }

    /// Throw away all URLs in the pool, so that the next URL taken comes from a fresh batch
    pub fn clear(&mut self) {
        debug!(discarded = self.urls.len(), "Discarding all unused signed URLs");
        self.urls.clear();
    }

    /// Take the URL for the chunk at `chunk_index`, requesting a new batch of URLs first if
    /// the pool doesn't have one.
    ///
    /// Returns the URL and, if a batch was requested to get it, the batch size.
    pub async fn take(&mut self, chunk_index: usize) -> Result<(Url, Option<usize>)> {
        // URLs for chunks that are already done can never be used
        while matches!(self.urls.front(), Some((index, _)) if *index < chunk_index) {
            self.urls.pop_front();
        }

        if matches!(self.urls.front(), Some((index, _)) if *index > chunk_index) {
            // This chunk's URL was used up by a failed attempt.  The URLs for the chunks after it
            // are useless until this chunk is done, and will be part of the next batch anyway.
            debug!(
                chunk_index,
                "No URL left for this chunk; discarding the URLs for later chunks"
            );
            self.urls.clear();
        }

        let mut issued = None;
        if self.urls.is_empty() {
            issued = Some(self.refill(chunk_index).await?);
        }

        let (index, url) = self
            .urls
            .pop_front()
            .expect("BUG: the pool was just refilled starting at this chunk");
        assert_eq!(
            chunk_index, index,
            "BUG: URL batches always start at the chunk that needs a URL"
        );

        Ok((url, issued))
    }

    /// Request a batch of URLs starting at `chunk_index`
    async fn refill(&mut self, chunk_index: usize) -> Result<usize> {
        let parts = match self.total_parts {
            Some(total_parts) => (total_parts - chunk_index).min(self.max_batch_size),
            // A batch can't reach past the last part the object store allows
            None => (MAX_PARTS - chunk_index).min(self.max_batch_size),
        };

        let UrlBatch {
            upload_key,
            first_part,
            urls,
        } = self
            .api
            .issue_upload_urls(
                &self.bucket,
                &self.key,
                parts,
                chunk_index + 1,
                self.upload_key.as_deref(),
            )
            .await?;
        assert_eq!(
            chunk_index + 1,
            first_part,
            "BUG: batch must start at the requested part"
        );

        match &self.upload_key {
            None => {
                debug!(%upload_key, "Upload key assigned");
                self.upload_key = Some(upload_key);
            }
            Some(existing) if *existing != upload_key => {
                // The first key is the one that identifies this upload; keep using it
                warn!(
                    %existing,
                    returned = %upload_key,
                    "Object store returned a different upload key for a continuation batch; ignoring it"
                );
            }
            Some(_) => {}
        }

        let count = urls.len().min(parts);
        if urls.len() > parts {
            debug!(
                requested = parts,
                returned = urls.len(),
                "Ignoring extra URLs in batch"
            );
        }
        self.urls.extend(
            urls.into_iter()
                .take(parts)
                .enumerate()
                .map(|(offset, url)| (chunk_index + offset, url)),
        );

        Ok(count)
    }
}
