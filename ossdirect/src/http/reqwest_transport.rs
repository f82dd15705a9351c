use super::{
    HttpRequest, HttpResponse, HttpTransport, StreamingHttpResponse, TransportError,
};
use futures::TryStreamExt;
use snafu::{prelude::*, IntoError};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Implementation of [`HttpTransport`] on top of a `reqwest` client
#[derive(Clone)]
pub struct ReqwestTransport {
    inner: Arc<ReqwestTransportInner>,
}

struct ReqwestTransportInner {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Wrap an existing `reqwest` client, for callers that need to control timeouts, proxies, or
    /// TLS settings
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(ReqwestTransportInner { client }),
        }
    }

    fn build_request(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        self.inner
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip_all, fields(method = %request.method, url = %super::redact_url(&request.url)))]
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = request.method.clone();
        let url = super::redact_url(&request.url);

        let response = self
            .build_request(request)
            .send()
            .await
            .map_err(|e| send_error(method, url.clone(), e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .with_context(|_| super::ReadBodySnafu { url })?;

        debug!(%status, body_len = body.len(), "Received response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    #[instrument(skip_all, fields(method = %request.method, url = %super::redact_url(&request.url)))]
    async fn send_streaming(
        &self,
        request: HttpRequest,
    ) -> Result<StreamingHttpResponse, TransportError> {
        let method = request.method.clone();
        let url = super::redact_url(&request.url);

        let response = self
            .build_request(request)
            .send()
            .await
            .map_err(|e| send_error(method, url.clone(), e))?;

        let status = response.status();
        let headers = response.headers().clone();

        debug!(%status, "Received response headers; body will be streamed");

        let body = response
            .bytes_stream()
            .map_err(move |source| super::ReadBodySnafu { url: url.clone() }.into_error(source));

        Ok(StreamingHttpResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

/// Connection failures are told apart from other failures to send, like timeouts or TLS errors
fn send_error(method: http::Method, url: String, source: reqwest::Error) -> TransportError {
    if source.is_connect() {
        super::ConnectionSnafu { url }.into_error(source.into())
    } else {
        super::SendRequestSnafu { method, url }.into_error(source)
    }
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReqwestTransport")
    }
}
