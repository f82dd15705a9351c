//! Typed calls to the object store REST API: issuing signed URLs and completing uploads.
//!
//! Everything here is authorized with a bearer token.  The part transfers themselves go directly
//! to the signed URLs and are in [`crate::part`].
use crate::credentials::SharedTokenProvider;
use crate::error::{ApiError, BoxedError};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::{Config, Result};
use bytes::Bytes;
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Method, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

const ISSUE_UPLOAD_URLS: &str = "signed upload URL";
const COMPLETE_UPLOAD: &str = "complete upload";
const ISSUE_DOWNLOAD_URL: &str = "signed download URL";

/// The header which carries the content type of the object at completion
const CONTENT_TYPE_META_HEADER: &str = "x-ads-meta-content-type";

/// Wait this long after a 429 response that doesn't say how long to wait
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Rejected bodies are included in errors, but only up to this many bytes of them
const MAX_ERROR_BODY_LEN: usize = 1024;

/// Characters escaped in path segments; everything except what `encodeURIComponent` leaves alone
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// The details of an object, as reported by the object store when an upload is completed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDetails {
    pub bucket_key: String,
    pub object_key: String,
    pub object_id: String,
    pub size: u64,
    pub sha1: Option<String>,
    pub location: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UrlBatchResponse {
    upload_key: String,
    urls: Vec<String>,
}

/// A batch of signed upload URLs, one for each part starting at `first_part`
#[derive(Clone, Debug)]
pub(crate) struct UrlBatch {
    pub upload_key: String,

    /// 1-based part number the first URL is for
    pub first_part: usize,

    pub urls: Vec<Url>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteUploadRequest<'a> {
    upload_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct DownloadUrlResponse {
    status: String,
    url: Option<String>,
    size: Option<u64>,
}

/// The status reported when an object can be downloaded
const DOWNLOAD_READY_STATUS: &str = "complete";

/// The outcome of a download URL request
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DownloadUrl {
    Ready { url: Url, size: Option<u64> },

    /// The object exists but isn't ready to download, for example because it's still being
    /// assembled.  There's no URL.
    NotReady { status: String },
}

/// Client for the authorized object store API calls, built from the job's config
#[derive(Clone, Debug)]
pub(crate) struct ObjectStoreApi {
    config: Config,
    transport: Box<dyn HttpTransport>,
    token_provider: SharedTokenProvider,
}

impl ObjectStoreApi {
    pub fn new(
        config: Config,
        transport: Box<dyn HttpTransport>,
        token_provider: SharedTokenProvider,
    ) -> Self {
        Self {
            config,
            transport,
            token_provider,
        }
    }

    pub fn transport(&self) -> &dyn HttpTransport {
        self.transport.as_ref()
    }

    /// Request signed URLs for `parts` consecutive parts starting at the 1-based `first_part`.
    ///
    /// `upload_key` must be `None` on the first request of an upload, and the key returned by the
    /// first request on every request after that.
    #[instrument(skip(self, upload_key), fields(continuation = upload_key.is_some()))]
    pub async fn issue_upload_urls(
        &self,
        bucket: &str,
        key: &str,
        parts: usize,
        first_part: usize,
        upload_key: Option<&str>,
    ) -> Result<UrlBatch> {
        let context = crate::error::IssueUploadUrlsSnafu {
            bucket,
            key,
            first_part,
        };

        let mut url = self
            .object_url(bucket, key, "signeds3upload")
            .context(context)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("parts", &parts.to_string());
            query.append_pair("firstPart", &first_part.to_string());
            if let Some(upload_key) = upload_key {
                query.append_pair("uploadKey", upload_key);
            }
            if let Some(minutes) = self.config.minutes_expiration {
                query.append_pair("minutesExpiration", &minutes.to_string());
            }
        }

        let request = self.authorized_request(Method::GET, url).await?;
        let response = self
            .send_rate_limited(ISSUE_UPLOAD_URLS, request)
            .await
            .context(context)?;
        let batch = parse_url_batch(&response.body, first_part).context(context)?;

        debug!(
            urls = batch.urls.len(),
            "Received batch of signed upload URLs"
        );

        Ok(batch)
    }

    /// Assemble the uploaded parts into the final object.
    ///
    /// This is not retried; whatever the response is, it's final.
    #[instrument(skip(self, upload_key, content_type))]
    pub async fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_key: &str,
        content_type: Option<&HeaderValue>,
    ) -> Result<ObjectDetails> {
        let context = crate::error::FinalizationFailedSnafu { bucket, key };

        let url = self
            .object_url(bucket, key, "signeds3upload")
            .context(context)?;
        let body = serde_json::to_vec(&CompleteUploadRequest { upload_key })
            .expect("BUG: serializing a struct of strings can't fail");

        let mut request = self.authorized_request(Method::POST, url).await?;
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(content_type) = content_type {
            request
                .headers
                .insert(CONTENT_TYPE_META_HEADER, content_type.clone());
        }
        request.body = Bytes::from(body);

        let response = self
            .send_once(COMPLETE_UPLOAD, request)
            .await
            .context(context)?;

        parse_json(COMPLETE_UPLOAD, &response.body).context(context)
    }

    /// Request a signed URL for downloading an object.
    ///
    /// The object may not be ready for download, in which case there is no URL.  Whether that's
    /// an error is up to the caller.
    #[instrument(skip(self))]
    pub async fn issue_download_url(&self, bucket: &str, key: &str) -> Result<DownloadUrl> {
        let context = crate::error::IssueDownloadUrlSnafu { bucket, key };

        let mut url = self
            .object_url(bucket, key, "signeds3download")
            .context(context)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(minutes) = self.config.minutes_expiration {
                query.append_pair("minutesExpiration", &minutes.to_string());
            }
            if self.config.use_cdn {
                query.append_pair("useCdn", "true");
            }
        }
        // An empty `query_pairs_mut` still leaves a trailing `?`
        if url.query() == Some("") {
            url.set_query(None);
        }

        let request = self.authorized_request(Method::GET, url).await?;
        let response = self
            .send_rate_limited(ISSUE_DOWNLOAD_URL, request)
            .await
            .context(context)?;

        let download_url = parse_download_url(&response.body).context(context)?;
        match &download_url {
            DownloadUrl::Ready { url, size } => {
                debug!(url = %crate::http::redact_url(url), ?size, "Object is ready to download")
            }
            DownloadUrl::NotReady { status } => debug!(%status, "Object is not ready to download"),
        }

        Ok(download_url)
    }

    /// URL of one of the endpoints of an object
    fn object_url(&self, bucket: &str, key: &str, endpoint: &str) -> Result<Url, ApiError> {
        let path = format!(
            "buckets/{}/objects/{}/{endpoint}",
            encode_path_segment(bucket),
            encode_path_segment(key)
        );

        self.config
            .base_url
            .join(&path)
            .with_context(|_| crate::error::InvalidRequestUrlSnafu {
                operation: "object endpoint",
            })
    }

    /// Start a request with a fresh bearer token from the token provider
    async fn authorized_request(&self, method: Method, url: Url) -> Result<HttpRequest> {
        let token = self
            .token_provider
            .access_token()
            .await
            .context(crate::error::AccessTokenSnafu)?;

        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Box::new(e) as BoxedError)
            .context(crate::error::AccessTokenSnafu)?;
        value.set_sensitive(true);

        let mut request = HttpRequest::new(method, url);
        request.headers.insert(AUTHORIZATION, value);

        Ok(request)
    }

    async fn send_once(
        &self,
        operation: &'static str,
        request: HttpRequest,
    ) -> Result<HttpResponse, ApiError> {
        let response = self
            .transport
            .send(request)
            .await
            .context(crate::error::TransportSnafu { operation })?;

        check_status(operation, response)
    }

    /// Send the request, and as long as the object store says it's rate limited, wait as long as
    /// it asks and then send the identical request again.
    async fn send_rate_limited(
        &self,
        operation: &'static str,
        request: HttpRequest,
    ) -> Result<HttpResponse, ApiError> {
        let mut waits = 0;

        loop {
            let response = self
                .transport
                .send(request.clone())
                .await
                .context(crate::error::TransportSnafu { operation })?;

            if response.status != StatusCode::TOO_MANY_REQUESTS {
                return check_status(operation, response);
            }

            ensure!(
                waits < self.config.max_rate_limit_waits,
                crate::error::RateLimitExhaustedSnafu { operation, waits }
            );

            let delay = retry_after(&response.headers);
            waits += 1;
            warn!(
                operation,
                waits,
                delay_secs = delay.as_secs(),
                "Object store is rate limiting; waiting before sending the request again"
            );

            tokio::time::sleep(delay).await;
        }
    }
}

fn check_status(operation: &'static str, response: HttpResponse) -> Result<HttpResponse, ApiError> {
    let status = response.status;

    ensure!(
        status != StatusCode::UNAUTHORIZED,
        crate::error::UnauthorizedSnafu { operation, status }
    );
    ensure!(
        !status.is_client_error() && !status.is_server_error(),
        crate::error::UnexpectedStatusSnafu {
            operation,
            status,
            body: body_excerpt(&response.body),
        }
    );

    Ok(response)
}

/// The start of a response body as text, for error messages
pub(crate) fn body_excerpt(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(MAX_ERROR_BODY_LEN)]).into_owned()
}

/// How long a 429 response asks the client to wait.  Only the delay-seconds form of
/// `Retry-After` is supported.
fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn encode_path_segment(segment: &str) -> String {
    let encoded = utf8_percent_encode(segment, PATH_SEGMENT).to_string();

    // Dot segments would be resolved away when joined to the base URL
    if encoded == "." || encoded == ".." {
        encoded.replace('.', "%2E")
    } else {
        encoded
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    operation: &'static str,
    body: &[u8],
) -> Result<T, ApiError> {
    serde_json::from_slice(body).context(crate::error::MalformedResponseSnafu { operation })
}

fn parse_download_url(body: &[u8]) -> Result<DownloadUrl, ApiError> {
    let response: DownloadUrlResponse = parse_json(ISSUE_DOWNLOAD_URL, body)?;

    if response.status != DOWNLOAD_READY_STATUS {
        return Ok(DownloadUrl::NotReady {
            status: response.status,
        });
    }

    let url = response
        .url
        .context(crate::error::MissingFieldSnafu {
            operation: ISSUE_DOWNLOAD_URL,
            field: "url",
        })?
        .parse::<Url>()
        .context(crate::error::InvalidSignedUrlSnafu {
            operation: ISSUE_DOWNLOAD_URL,
        })?;

    Ok(DownloadUrl::Ready {
        url,
        size: response.size,
    })
}

fn parse_url_batch(body: &[u8], first_part: usize) -> Result<UrlBatch, ApiError> {
    let response: UrlBatchResponse = parse_json(ISSUE_UPLOAD_URLS, body)?;

    ensure!(
        !response.urls.is_empty(),
        crate::error::EmptyUrlBatchSnafu {
            operation: ISSUE_UPLOAD_URLS
        }
    );

    let urls = response
        .urls
        .iter()
        .map(|url| url.parse::<Url>())
        .collect::<Result<Vec<_>, _>>()
        .context(crate::error::InvalidSignedUrlSnafu {
            operation: ISSUE_UPLOAD_URLS,
        })?;

    Ok(UrlBatch {
        upload_key: response.upload_key,
        first_part,
        urls,
    })
}
