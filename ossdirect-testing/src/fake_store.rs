//! An in-memory fake of the object store REST API and its signed URLs.
//!
//! [`FakeObjectStore`] implements [`HttpTransport`], so jobs configured with it as their transport
//! never touch the network.  It behaves like the real object store in the ways the transfer engine
//! depends on (one-time-use signed URLs, upload keys, rate limiting, readiness status) and lets
//! tests inject failures into specific requests.
use bytes::Bytes;
use futures::StreamExt;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use ossdirect::http::{
    HttpRequest, HttpResponse, HttpTransport, StreamingHttpResponse, TransportError,
};
use ossdirect::{Config, StaticAccessToken};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// The API base URL jobs must be configured with to talk to the fake
pub const BASE_URL: &str = "https://oss.test/oss/v2/";

/// The only bearer token the fake accepts
pub const ACCESS_TOKEN: &str = "fake-access-token";

const SIGNED_URL_HOST: &str = "s3.test";

/// Signed download responses are streamed in chunks of this size
const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// A failure to inject into a part upload attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartFault {
    /// Respond with this status
    Status(StatusCode),

    /// Expire every outstanding URL of the upload, then respond 403 like an expired URL does
    ExpireUrls,

    /// Fail without any response, as if the connection was reset
    ConnectionReset,
}

/// A request for signed upload URLs, as received by the fake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadUrlRequest {
    pub parts: usize,
    pub first_part: usize,
    pub upload_key: Option<String>,
    pub minutes_expiration: Option<u32>,
}

/// A request for a signed download URL, as received by the fake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadUrlRequest {
    pub minutes_expiration: Option<u32>,
    pub use_cdn: bool,
}

/// One attempt to PUT a part to a signed URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartAttempt {
    pub part_number: usize,

    /// The response status, or `None` if the attempt failed with a transport error
    pub status: Option<StatusCode>,
}

/// A completion request, as received by the fake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRequest {
    pub upload_key: String,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,

    /// Readiness status reported when a download URL is requested
    pub status: String,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<usize, Bytes>,
}

#[derive(Debug)]
struct IssuedUploadUrl {
    upload_key: String,
    part_number: usize,
    used: bool,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    uploads: HashMap<String, PendingUpload>,
    upload_urls: HashMap<String, IssuedUploadUrl>,
    download_urls: HashMap<String, (String, String)>,
    objects: HashMap<(String, String), StoredObject>,

    part_faults: HashMap<usize, VecDeque<PartFault>>,
    rate_limited_requests: usize,
    retry_after: Option<String>,
    completion_failure: Option<StatusCode>,
    download_interrupted_after: Option<usize>,
    access_token: Option<String>,

    upload_url_requests: Vec<UploadUrlRequest>,
    download_url_requests: Vec<DownloadUrlRequest>,
    part_attempts: Vec<PartAttempt>,
    completions: Vec<CompletionRequest>,
    rate_limited_responses: usize,
    download_gets: usize,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone)]
pub struct FakeObjectStore {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for FakeObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FakeObjectStore")
    }
}

impl Default for FakeObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Default config, pointed at the fake
    pub fn config(&self) -> Config {
        Config {
            base_url: BASE_URL.parse().unwrap(),
            ..Default::default()
        }
    }

    /// A token provider with the token the fake accepts
    pub fn token(&self) -> StaticAccessToken {
        StaticAccessToken::new(ACCESS_TOKEN)
    }

    /// Accept a different token than [`ACCESS_TOKEN`] from now on
    pub fn set_access_token(&self, token: impl Into<String>) {
        self.state().access_token = Some(token.into());
    }

    /// Inject failures into the next attempts to upload `part_number`, in order.  Attempts
    /// after these failures behave normally.
    pub fn fail_part(&self, part_number: usize, faults: impl IntoIterator<Item = PartFault>) {
        self.state()
            .part_faults
            .entry(part_number)
            .or_default()
            .extend(faults);
    }

    /// Respond 429 to the next `count` signed URL requests (upload or download)
    pub fn rate_limit(&self, count: usize, retry_after: Option<&str>) {
        let mut state = self.state();
        state.rate_limited_requests = count;
        state.retry_after = retry_after.map(|value| value.to_string());
    }

    /// Respond to completion requests with this status instead of completing the upload
    pub fn fail_completion(&self, status: StatusCode) {
        self.state().completion_failure = Some(status);
    }

    /// Lose the connection of every download after sending this many bytes of the object
    pub fn interrupt_downloads_after(&self, bytes: usize) {
        self.state().download_interrupted_after = Some(bytes);
    }

    /// Store an object directly, for download tests
    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.state().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.into(),
                content_type: "application/octet-stream".to_string(),
                status: "complete".to_string(),
            },
        );
    }

    /// Change the readiness status of an object that's already stored
    pub fn set_object_status(&self, bucket: &str, key: &str, status: &str) {
        self.state()
            .objects
            .get_mut(&(bucket.to_string(), key.to_string()))
            .expect("BUG: object doesn't exist")
            .status = status.to_string();
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn upload_url_requests(&self) -> Vec<UploadUrlRequest> {
        self.state().upload_url_requests.clone()
    }

    pub fn download_url_requests(&self) -> Vec<DownloadUrlRequest> {
        self.state().download_url_requests.clone()
    }

    pub fn part_attempts(&self) -> Vec<PartAttempt> {
        self.state().part_attempts.clone()
    }

    /// The number of attempts to upload one part
    pub fn attempts_for_part(&self, part_number: usize) -> usize {
        self.state()
            .part_attempts
            .iter()
            .filter(|attempt| attempt.part_number == part_number)
            .count()
    }

    pub fn completions(&self) -> Vec<CompletionRequest> {
        self.state().completions.clone()
    }

    pub fn rate_limited_responses(&self) -> usize {
        self.state().rate_limited_responses
    }

    /// The number of GET requests made to signed download URLs
    pub fn download_gets(&self) -> usize {
        self.state().download_gets
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn handle(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut state = self.state();

        match request.url.host_str() {
            Some(SIGNED_URL_HOST) => Self::handle_signed_url(&mut state, request),
            _ => Ok(Self::handle_api(&mut state, request)),
        }
    }

    fn handle_api(state: &mut State, request: HttpRequest) -> HttpResponse {
        let expected = format!(
            "Bearer {}",
            state.access_token.as_deref().unwrap_or(ACCESS_TOKEN)
        );
        if request.headers.get(header::AUTHORIZATION).map(|v| v.as_bytes()) != Some(expected.as_bytes()) {
            return response(StatusCode::UNAUTHORIZED, r#"{"reason":"Invalid access token"}"#);
        }

        // buckets/{bucket}/objects/{key}/{endpoint} relative to the base URL
        let Some(path) = request.url.path().strip_prefix("/oss/v2/") else {
            return response(StatusCode::NOT_FOUND, "");
        };
        let segments: Vec<String> = path
            .split('/')
            .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
            .collect();
        let [buckets, bucket, objects, key, endpoint] = segments.as_slice() else {
            return response(StatusCode::NOT_FOUND, "");
        };
        if buckets != "buckets" || objects != "objects" {
            return response(StatusCode::NOT_FOUND, "");
        }

        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();

        match (&request.method, endpoint.as_str()) {
            (&Method::GET, "signeds3upload") => {
                if let Some(response) = Self::rate_limited(state) {
                    return response;
                }
                Self::issue_upload_urls(state, bucket, key, &query)
            }
            (&Method::POST, "signeds3upload") => {
                Self::complete_upload(state, bucket, key, &request.headers, &request.body)
            }
            (&Method::GET, "signeds3download") => {
                if let Some(response) = Self::rate_limited(state) {
                    return response;
                }
                Self::issue_download_url(state, bucket, key, &query)
            }
            _ => response(StatusCode::METHOD_NOT_ALLOWED, ""),
        }
    }

    fn rate_limited(state: &mut State) -> Option<HttpResponse> {
        if state.rate_limited_requests == 0 {
            return None;
        }

        state.rate_limited_requests -= 1;
        state.rate_limited_responses += 1;

        let mut response = response(StatusCode::TOO_MANY_REQUESTS, "");
        if let Some(retry_after) = &state.retry_after {
            response
                .headers
                .insert(header::RETRY_AFTER, HeaderValue::from_str(retry_after).unwrap());
        }

        Some(response)
    }

    fn issue_upload_urls(
        state: &mut State,
        bucket: &str,
        key: &str,
        query: &HashMap<String, String>,
    ) -> HttpResponse {
        let parse = |name: &str| query.get(name).and_then(|value| value.parse::<usize>().ok());
        let (Some(parts), Some(first_part)) = (parse("parts"), parse("firstPart")) else {
            return response(StatusCode::BAD_REQUEST, r#"{"reason":"parts and firstPart are required"}"#);
        };
        if parts == 0 || first_part == 0 || first_part + parts - 1 > 10_000 {
            return response(StatusCode::BAD_REQUEST, r#"{"reason":"invalid part range"}"#);
        }

        let request = UploadUrlRequest {
            parts,
            first_part,
            upload_key: query.get("uploadKey").cloned(),
            minutes_expiration: query
                .get("minutesExpiration")
                .and_then(|value| value.parse().ok()),
        };
        debug!(?request, "Fake object store issuing upload URLs");
        state.upload_url_requests.push(request.clone());

        let upload_key = match request.upload_key {
            Some(upload_key) => {
                match state.uploads.get(&upload_key) {
                    Some(upload) if upload.bucket == bucket && upload.key == key => {}
                    _ => {
                        return response(StatusCode::BAD_REQUEST, r#"{"reason":"unknown upload key"}"#)
                    }
                }
                upload_key
            }
            None => {
                let upload_key = format!("upload-key-{}", state.next_id());
                state.uploads.insert(
                    upload_key.clone(),
                    PendingUpload {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        parts: BTreeMap::new(),
                    },
                );
                upload_key
            }
        };

        let urls = (first_part..first_part + parts)
            .map(|part_number| {
                let token = format!("u{}", state.next_id());
                state.upload_urls.insert(
                    token.clone(),
                    IssuedUploadUrl {
                        upload_key: upload_key.clone(),
                        part_number,
                        used: false,
                    },
                );
                format!("https://{SIGNED_URL_HOST}/upload/{token}?X-Amz-Signature=sig-{token}")
            })
            .collect::<Vec<_>>();

        json_response(
            StatusCode::OK,
            serde_json::json!({ "uploadKey": upload_key, "urls": urls }),
        )
    }

    fn complete_upload(
        state: &mut State,
        bucket: &str,
        key: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> HttpResponse {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CompleteRequest {
            upload_key: String,
        }

        let Ok(CompleteRequest { upload_key }) = serde_json::from_slice::<CompleteRequest>(body) else {
            return response(StatusCode::BAD_REQUEST, r#"{"reason":"uploadKey is required"}"#);
        };
        let content_type = headers
            .get("x-ads-meta-content-type")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        state.completions.push(CompletionRequest {
            upload_key: upload_key.clone(),
            content_type: content_type.clone(),
        });

        if let Some(status) = state.completion_failure {
            return response(status, r#"{"reason":"injected completion failure"}"#);
        }

        let Some(upload) = state.uploads.get(&upload_key) else {
            return response(StatusCode::BAD_REQUEST, r#"{"reason":"unknown upload key"}"#);
        };
        if upload.bucket != bucket || upload.key != key {
            return response(StatusCode::BAD_REQUEST, r#"{"reason":"upload key is for another object"}"#);
        }

        // Parts must be 1..=n with nothing missing
        let contiguous = upload
            .parts
            .keys()
            .enumerate()
            .all(|(index, part_number)| *part_number == index + 1);
        if upload.parts.is_empty() || !contiguous {
            return response(StatusCode::BAD_REQUEST, r#"{"reason":"missing parts"}"#);
        }

        let mut data = Vec::new();
        for part in upload.parts.values() {
            data.extend_from_slice(part);
        }

        let upload = state.uploads.remove(&upload_key).unwrap();
        state
            .upload_urls
            .retain(|_, issued| issued.upload_key != upload_key);

        let object = StoredObject {
            data: Bytes::from(data),
            content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            status: "complete".to_string(),
        };
        let details = serde_json::json!({
            "bucketKey": upload.bucket,
            "objectKey": upload.key,
            "objectId": format!("urn:adsk.objects:os.object:{}/{}", upload.bucket, upload.key),
            "size": object.data.len(),
            "contentType": object.content_type,
            "location": format!("{BASE_URL}buckets/{}/objects/{}", upload.bucket, upload.key),
        });
        state.objects.insert((upload.bucket, upload.key), object);

        json_response(StatusCode::OK, details)
    }

    fn issue_download_url(
        state: &mut State,
        bucket: &str,
        key: &str,
        query: &HashMap<String, String>,
    ) -> HttpResponse {
        state.download_url_requests.push(DownloadUrlRequest {
            minutes_expiration: query
                .get("minutesExpiration")
                .and_then(|value| value.parse().ok()),
            use_cdn: query.get("useCdn").map(|value| value == "true").unwrap_or(false),
        });

        let Some(object) = state.objects.get(&(bucket.to_string(), key.to_string())) else {
            return response(StatusCode::NOT_FOUND, r#"{"reason":"object not found"}"#);
        };

        if object.status != "complete" {
            return json_response(
                StatusCode::OK,
                serde_json::json!({ "status": object.status }),
            );
        }

        let size = object.data.len();
        let token = format!("d{}", state.next_id());
        state
            .download_urls
            .insert(token.clone(), (bucket.to_string(), key.to_string()));

        json_response(
            StatusCode::OK,
            serde_json::json!({
                "status": "complete",
                "url": format!("https://{SIGNED_URL_HOST}/download/{token}?X-Amz-Signature=sig-{token}"),
                "size": size,
            }),
        )
    }

    fn handle_signed_url(
        state: &mut State,
        request: HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        assert!(
            request.headers.get(header::AUTHORIZATION).is_none(),
            "signed URL requests must not carry an access token"
        );

        let url = request.url.to_string();
        let path = request.url.path().to_string();

        if let Some(token) = path.strip_prefix("/upload/") {
            if request.method != Method::PUT {
                return Ok(response(StatusCode::METHOD_NOT_ALLOWED, ""));
            }

            Self::upload_part(state, token, request.body, url)
        } else if let Some(token) = path.strip_prefix("/download/") {
            if request.method != Method::GET {
                return Ok(response(StatusCode::METHOD_NOT_ALLOWED, ""));
            }
            state.download_gets += 1;

            Ok(match state.download_urls.get(token) {
                Some(object_id) => {
                    let object = &state.objects[object_id];
                    let mut response = HttpResponse {
                        status: StatusCode::OK,
                        headers: HeaderMap::new(),
                        body: object.data.clone(),
                    };
                    response.headers.insert(
                        header::CONTENT_LENGTH,
                        HeaderValue::from(object.data.len()),
                    );
                    response
                }
                None => response(StatusCode::FORBIDDEN, "<Error><Code>AccessDenied</Code></Error>"),
            })
        } else {
            Ok(response(StatusCode::NOT_FOUND, ""))
        }
    }

    fn upload_part(
        state: &mut State,
        token: &str,
        body: Bytes,
        url: String,
    ) -> Result<HttpResponse, TransportError> {
        let Some(issued) = state.upload_urls.get_mut(token) else {
            return Ok(response(StatusCode::FORBIDDEN, "<Error><Code>AccessDenied</Code></Error>"));
        };
        let part_number = issued.part_number;
        let upload_key = issued.upload_key.clone();
        let already_used = std::mem::replace(&mut issued.used, true);

        let fault = state
            .part_faults
            .get_mut(&part_number)
            .and_then(|faults| faults.pop_front());

        let status = match fault {
            Some(PartFault::ConnectionReset) => {
                state.part_attempts.push(PartAttempt {
                    part_number,
                    status: None,
                });

                return Err(TransportError::Connection {
                    url,
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionReset).into(),
                });
            }
            Some(PartFault::Status(status)) => status,
            Some(PartFault::ExpireUrls) => {
                for issued in state.upload_urls.values_mut() {
                    if issued.upload_key == upload_key {
                        issued.used = true;
                    }
                }
                StatusCode::FORBIDDEN
            }
            None if already_used => StatusCode::FORBIDDEN,
            None => {
                if let Some(upload) = state.uploads.get_mut(&upload_key) {
                    upload.parts.insert(part_number, body);
                }
                StatusCode::OK
            }
        };

        debug!(part_number, %status, "Fake object store received part");
        state.part_attempts.push(PartAttempt {
            part_number,
            status: Some(status),
        });

        Ok(if status == StatusCode::FORBIDDEN {
            response(status, "<Error><Code>AccessDenied</Code><Message>Request has expired</Message></Error>")
        } else {
            response(status, "")
        })
    }
}

fn response(status: StatusCode, body: &'static str) -> HttpResponse {
    HttpResponse {
        status,
        headers: HeaderMap::new(),
        body: Bytes::from_static(body.as_bytes()),
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    HttpResponse {
        status,
        headers,
        body: Bytes::from(body.to_string()),
    }
}

#[async_trait::async_trait]
impl HttpTransport for FakeObjectStore {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.handle(request)
    }

    async fn send_streaming(
        &self,
        request: HttpRequest,
    ) -> Result<StreamingHttpResponse, TransportError> {
        let url = request.url.to_string();
        let HttpResponse {
            status,
            headers,
            body,
        } = self.handle(request)?;

        let interrupted_after = if status.is_success() {
            self.state().download_interrupted_after
        } else {
            None
        };
        let sent = interrupted_after.unwrap_or(body.len()).min(body.len());

        let mut chunks = (0..sent)
            .step_by(DOWNLOAD_CHUNK_SIZE)
            .map(|start| {
                Ok::<_, TransportError>(body.slice(start..(start + DOWNLOAD_CHUNK_SIZE).min(sent)))
            })
            .collect::<Vec<_>>();
        if interrupted_after.is_some() {
            chunks.push(Err(TransportError::Connection {
                url: url.clone(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionAborted).into(),
            }));
        }

        Ok(StreamingHttpResponse {
            status,
            headers,
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}
