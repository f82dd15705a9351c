//! The HTTP transport over which all object store requests and part transfers are sent.
//!
//! The engine builds every request itself (URLs, query strings, headers, bodies) and interprets
//! every response itself, so a transport only has to move bytes.  [`ReqwestTransport`] is the
//! implementation used in production; tests substitute an in-memory fake of the object store.
use bytes::Bytes;
use dyn_clone::DynClone;
use futures::stream::BoxStream;
use http::{HeaderMap, Method, StatusCode};
use snafu::prelude::*;
use url::Url;

mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

/// A fully-formed HTTP request ready to be sent by a [`HttpTransport`]
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// A response whose body has been read into memory
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A response whose body hasn't been read yet, and is exposed as a stream of chunks as they
/// arrive
pub struct StreamingHttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl StreamingHttpResponse {
    /// The `Content-Length` of the response, if the server provided one
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }
}

impl std::fmt::Debug for StreamingHttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingHttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"<stream>")
            .finish()
    }
}

/// Network-level failure to complete an HTTP exchange.  This means no HTTP status was received
/// (connection refused or reset, timeout, TLS failure, etc).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("Error sending {method} request to {url}"))]
    SendRequest {
        method: Method,
        url: String,
        source: ::reqwest::Error,
    },

    #[snafu(display("Error reading the response body from {url}"))]
    ReadBody {
        url: String,
        source: ::reqwest::Error,
    },

    /// No connection to the server could be established, or it was lost before a response
    /// arrived.  Custom transports report their own connection failures with this too.
    #[snafu(display("Connection to {url} failed"))]
    Connection {
        url: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Something that can send [`HttpRequest`]s.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait HttpTransport: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Send the request and read the entire response body into memory.
    ///
    /// Only fails if no response was received; any HTTP status, including errors, is `Ok`.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Send the request and return as soon as the response headers are received.  The body is
    /// read incrementally by polling the returned stream.
    async fn send_streaming(
        &self,
        request: HttpRequest,
    ) -> Result<StreamingHttpResponse, TransportError>;
}

dyn_clone::clone_trait_object!(HttpTransport);

/// Render a URL for logs and error messages without its query string.
///
/// Signed URLs carry their signature in the query, which is as good as a credential for as long as
/// the URL is valid.
pub(crate) fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.set_fragment(None);
    redacted.to_string()
}
