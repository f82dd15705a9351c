use crate::api::{ObjectDetails, ObjectStoreApi};
use crate::Result;
use http::HeaderValue;
use tracing::{error, info, instrument};

/// Completes an upload once all of its parts are uploaded, assembling them into the object.
///
/// Completion is attempted exactly once.  If it fails the parts stay in the object store
/// unassembled, and the whole upload has to be started over.
#[derive(Debug)]
pub(crate) struct CompletionFinalizer<'a> {
    pub api: &'a ObjectStoreApi,
    pub bucket: &'a str,
    pub key: &'a str,
    pub content_type: Option<&'a HeaderValue>,
}

impl CompletionFinalizer<'_> {
    #[instrument(skip(self, upload_key), fields(bucket = self.bucket, key = self.key))]
    pub async fn finalize(&self, upload_key: &str, total_parts: usize) -> Result<ObjectDetails> {
        match self
            .api
            .complete_upload(self.bucket, self.key, upload_key, self.content_type)
            .await
        {
            Ok(details) => {
                info!(
                    object_id = %details.object_id,
                    size = details.size,
                    "Upload completed"
                );

                Ok(details)
            }
            Err(e) => {
                error!(err = ?e, "Completing the upload failed");

                Err(e)
            }
        }
    }
}
