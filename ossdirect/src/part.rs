//! A single transfer against a single signed URL.
//!
//! Nothing here retries; a transfer either succeeds or its failure is classified so that the
//! caller can decide what to do about it.
use crate::error::PartFailure;
use crate::http::{HttpRequest, HttpTransport, StreamingHttpResponse};
use bytes::Bytes;
use http::{Method, StatusCode};
use snafu::prelude::*;
use tracing::{debug, instrument};
use url::Url;

/// The result of one attempt to upload a part
#[derive(Debug)]
pub(crate) enum PartOutcome {
    Success,

    /// The URL was rejected with 403, which means it expired or was already used
    StaleUrl,

    Failure(PartFailure),
}

impl PartOutcome {
    fn from_status(status: StatusCode, body: &[u8]) -> Self {
        if status == StatusCode::FORBIDDEN {
            Self::StaleUrl
        } else if status.is_client_error() || status.is_server_error() {
            Self::Failure(PartFailure::PartStatus {
                status,
                body: crate::api::body_excerpt(body),
            })
        } else {
            Self::Success
        }
    }
}

/// PUT the data of one part to its signed URL.
///
/// Signed URLs carry their own authorization, so no token is sent.
#[instrument(skip_all, fields(url = %crate::http::redact_url(&url), len = data.len()))]
pub(crate) async fn upload_part(transport: &dyn HttpTransport, url: Url, data: Bytes) -> PartOutcome {
    let mut request = HttpRequest::new(Method::PUT, url);
    request.body = data;

    match transport.send(request).await {
        Ok(response) => {
            let outcome = PartOutcome::from_status(response.status, &response.body);
            debug!(status = %response.status, ?outcome, "Part upload attempt finished");

            outcome
        }
        Err(source) => PartOutcome::Failure(PartFailure::PartTransport { source }),
    }
}

/// GET an object from its signed download URL.
///
/// Only the response headers have been received when this returns; the body is streamed.
#[instrument(skip_all, fields(url = %crate::http::redact_url(&url)))]
pub(crate) async fn download_object(
    transport: &dyn HttpTransport,
    url: Url,
) -> Result<StreamingHttpResponse, PartFailure> {
    let response = transport
        .send_streaming(HttpRequest::new(Method::GET, url))
        .await
        .context(crate::error::PartTransportSnafu)?;

    let status = response.status;
    if !status.is_client_error() && !status.is_server_error() {
        return Ok(response);
    }

    // Error bodies are small, and worth including in the error
    let mut body = Vec::new();
    let mut stream = response.body;
    while let Some(Ok(chunk)) = futures::StreamExt::next(&mut stream).await {
        body.extend_from_slice(&chunk);
        if body.len() >= 1024 {
            break;
        }
    }

    match PartOutcome::from_status(status, &body) {
        PartOutcome::StaleUrl => crate::error::StaleUrlSnafu.fail(),
        PartOutcome::Failure(failure) => Err(failure),
        PartOutcome::Success => unreachable!("BUG: error statuses are never classified as success"),
    }
}
