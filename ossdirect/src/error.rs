use crate::http::TransportError;
use snafu::prelude::*;
use std::path::PathBuf;

pub type Result<T, E = OssDirectError> = std::result::Result<T, E>;

/// Boxed error type produced by caller-supplied callbacks, like [`crate::AccessTokenProvider`]
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum OssDirectError {
    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig { message: String },

    #[snafu(display("Unable to obtain an access token for the object store API"))]
    AccessToken { source: BoxedError },

    #[snafu(display(
        "The object '{key}' of {size} bytes would need {parts} parts at a chunk size of {chunk_size} bytes, but at most {max_parts} parts are allowed"
    ))]
    TooManyParts {
        key: String,
        size: u64,
        chunk_size: u64,
        parts: usize,
        max_parts: usize,
    },

    #[snafu(display("Error opening upload source file '{}'", path.display()))]
    OpenSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error reading part {part_number} of '{key}' from the upload source"))]
    ReadSource {
        key: String,
        part_number: usize,
        source: std::io::Error,
    },

    #[snafu(display(
        "Error requesting upload URLs for '{key}' in bucket '{bucket}' starting at part {first_part}"
    ))]
    IssueUploadUrls {
        bucket: String,
        key: String,
        first_part: usize,
        source: ApiError,
    },

    #[snafu(display(
        "Upload of part {part_number} of '{key}' in bucket '{bucket}' failed after {attempts} attempts"
    ))]
    RetryExhausted {
        bucket: String,
        key: String,
        part_number: usize,
        attempts: usize,
        source: PartFailure,
    },

    #[snafu(display(
        "All parts of '{key}' were uploaded to bucket '{bucket}' but completing the upload failed; the parts will not be assembled into an object"
    ))]
    FinalizationFailed {
        bucket: String,
        key: String,
        source: ApiError,
    },

    #[snafu(display("Error requesting a download URL for '{key}' in bucket '{bucket}'"))]
    IssueDownloadUrl {
        bucket: String,
        key: String,
        source: ApiError,
    },

    #[snafu(display(
        "The object '{key}' in bucket '{bucket}' is not available for download yet (status '{status}')"
    ))]
    ObjectNotReady {
        bucket: String,
        key: String,
        status: String,
    },

    #[snafu(display("Error downloading '{key}' from bucket '{bucket}'"))]
    DownloadObject {
        bucket: String,
        key: String,
        source: PartFailure,
    },

    #[snafu(display("Error creating download target file '{}'", path.display()))]
    CreateTarget {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error writing downloaded data of '{key}' to the download target"))]
    WriteTarget {
        key: String,
        source: std::io::Error,
    },

    #[snafu(display("The transfer was aborted"))]
    Aborted,
}

/// The ways a single call to the object store REST API can fail.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(display("The {operation} request could not be sent"))]
    Transport {
        operation: &'static str,
        source: TransportError,
    },

    #[snafu(display("The {operation} request was rejected with HTTP status {status}: {body}"))]
    UnexpectedStatus {
        operation: &'static str,
        status: http::StatusCode,
        body: String,
    },

    #[snafu(display(
        "The {operation} request was rejected as unauthorized (HTTP {status}); the access token is invalid or expired"
    ))]
    Unauthorized {
        operation: &'static str,
        status: http::StatusCode,
    },

    #[snafu(display("The {operation} response body doesn't match the expected schema"))]
    MalformedResponse {
        operation: &'static str,
        source: serde_json::Error,
    },

    #[snafu(display("The {operation} response is missing the '{field}' field"))]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },

    #[snafu(display("The {operation} response didn't contain any signed URLs"))]
    EmptyUrlBatch { operation: &'static str },

    #[snafu(display("The {operation} response contains an invalid signed URL"))]
    InvalidSignedUrl {
        operation: &'static str,
        source: url::ParseError,
    },

    #[snafu(display(
        "The {operation} request was still rate limited after waiting {waits} times"
    ))]
    RateLimitExhausted {
        operation: &'static str,
        waits: usize,
    },

    #[snafu(display("Unable to build the {operation} request URL"))]
    InvalidRequestUrl {
        operation: &'static str,
        source: url::ParseError,
    },
}

/// Why a single attempt to transfer one part through a signed URL failed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PartFailure {
    #[snafu(display("The signed URL is stale or already used (HTTP 403)"))]
    StaleUrl,

    #[snafu(display("The part transfer was rejected with HTTP status {status}: {body}"))]
    PartStatus { status: http::StatusCode, body: String },

    #[snafu(display("The part transfer could not be completed"))]
    PartTransport { source: TransportError },
}

impl PartFailure {
    /// The HTTP status the remote store responded with, if it responded at all
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::StaleUrl => Some(http::StatusCode::FORBIDDEN),
            Self::PartStatus { status, .. } => Some(*status),
            Self::PartTransport { .. } => None,
        }
    }
}
