//! HTTP client utilities shared by both servers.
//!
//! One factory builds a TLS client from a set of extra root certificates and
//! an optional client identity. With a client certificate configured the
//! transport negotiates HTTP/2 via ALPN (the hosted CA endpoint requires it);
//! without one, HTTP/1.1 is fine.
//!
//! Requests retry only on `429 Too Many Requests`, honoring an integer
//! `Retry-After` (seconds). Error bodies are read with a hard byte bound
//! before being folded into a [`StatusError`] that mirrors the upstream
//! status.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StatusError;

/// Upper bound on upstream error bodies folded into error messages.
pub const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Default retry budget for rate-limited outbound calls.
pub const DEFAULT_RETRIES: u32 = 2;

/// Builder for [`HttpClient`].
#[derive(Default)]
pub struct HttpClientBuilder {
    roots: Vec<reqwest::Certificate>,
    identity: Option<reqwest::Identity>,
    timeout: Option<Duration>,
}

impl HttpClientBuilder {
    /// Adds a trusted root certificate (PEM, possibly multiple blocks).
    pub fn add_root_pem(mut self, pem: &[u8]) -> Result<Self, StatusError> {
        let certs = reqwest::Certificate::from_pem_bundle(pem).map_err(|e| {
            StatusError::with_context(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to parse root certificate",
                &e,
            )
        })?;
        self.roots.extend(certs);
        Ok(self)
    }

    /// Adds a trusted root certificate in DER form.
    pub fn add_root_der(mut self, der: &[u8]) -> Result<Self, StatusError> {
        let cert = reqwest::Certificate::from_der(der).map_err(|e| {
            StatusError::with_context(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to parse root certificate",
                &e,
            )
        })?;
        self.roots.push(cert);
        Ok(self)
    }

    /// Sets the client certificate identity (concatenated cert + key PEM).
    pub fn identity_pem(mut self, pem: &[u8]) -> Result<Self, StatusError> {
        let identity = reqwest::Identity::from_pem(pem).map_err(|e| {
            StatusError::with_context(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to load client identity",
                &e,
            )
        })?;
        self.identity = Some(identity);
        Ok(self)
    }

    /// Sets a total per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the client.
    pub fn build(self) -> Result<HttpClient, StatusError> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        for root in self.roots {
            builder = builder.add_root_certificate(root);
        }
        if let Some(identity) = self.identity {
            builder = builder.identity(identity);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let inner = builder.build().map_err(|e| {
            StatusError::with_context(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to build HTTP client",
                &e,
            )
        })?;
        Ok(HttpClient { inner })
    }
}

/// A TLS-aware HTTP client with bounded 429 retry.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    /// Creates a client trusting only the system roots.
    pub fn new() -> Result<Self, StatusError> {
        Self::builder().build()
    }

    /// Returns a builder.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Sends a GET request.
    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, StatusError> {
        self.execute(reqwest::Method::GET, url, None, headers, DEFAULT_RETRIES)
            .await
    }

    /// Sends a GET request carrying a body.
    ///
    /// The identity server's `/token` endpoint reads its parameters from a
    /// GET body, so this unusual combination is deliberate.
    pub async fn get_with_body(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, StatusError> {
        self.execute(reqwest::Method::GET, url, Some(body), headers, DEFAULT_RETRIES)
            .await
    }

    /// Sends a POST request.
    pub async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, StatusError> {
        self.execute(reqwest::Method::POST, url, Some(body), headers, DEFAULT_RETRIES)
            .await
    }

    /// GETs a JSON document, decoding the response body.
    ///
    /// Non-2xx responses fold up to [`MAX_ERROR_BODY_BYTES`] of the body into
    /// a [`StatusError`] carrying the upstream status.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<T, StatusError> {
        let response = self.get(url, headers).await?;
        decode_json(response).await
    }

    /// POSTs a JSON body and decodes the JSON response.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        headers: &[(&str, &str)],
    ) -> Result<T, StatusError> {
        let payload = serde_json::to_vec(body).map_err(|e| {
            StatusError::with_context(StatusCode::BAD_REQUEST, "failed to encode request", &e)
        })?;
        let mut all = vec![("Content-Type", "application/json")];
        all.extend_from_slice(headers);
        let response = self
            .execute(reqwest::Method::POST, url, Some(payload), &all, DEFAULT_RETRIES)
            .await?;
        decode_json(response).await
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<Vec<u8>>,
        headers: &[(&str, &str)],
        retries: u32,
    ) -> Result<reqwest::Response, StatusError> {
        let mut header_map = HeaderMap::new();
        header_map.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                StatusError::with_context(StatusCode::BAD_REQUEST, "invalid header name", &e)
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                StatusError::with_context(StatusCode::BAD_REQUEST, "invalid header value", &e)
            })?;
            header_map.insert(name, value);
        }

        let mut builder = self.inner.request(method, url).headers(header_map);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let request = builder.build().map_err(|e| {
            StatusError::with_context(StatusCode::BAD_REQUEST, "failed to build request", &e)
        })?;

        let mut remaining = retries;
        loop {
            let attempt = request.try_clone().ok_or_else(|| {
                StatusError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "request body cannot be replayed",
                )
            })?;

            let response = self.inner.execute(attempt).await.map_err(transport_error)?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS || remaining == 0 {
                return Ok(response);
            }
            remaining -= 1;

            let wait = retry_after(response.headers()).unwrap_or(Duration::from_secs(1));
            tracing::info!(
                url = %request.url(),
                wait_secs = wait.as_secs(),
                remaining,
                "received 429 Too Many Requests, retrying"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

/// Reads at most `max` bytes from a response body.
///
/// The content length, when present, sizes the buffer up front; reading stops
/// at `max` bytes or end of stream, whichever comes first.
pub async fn read_body_limited(mut response: reqwest::Response, max: usize) -> Vec<u8> {
    let hint = response
        .content_length()
        .map(|len| (len as usize).min(max))
        .unwrap_or(0);
    let mut out = Vec::with_capacity(hint);

    while let Ok(Some(chunk)) = response.chunk().await {
        let remaining = max.saturating_sub(out.len());
        if remaining == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
    out
}

/// Converts a non-2xx response into a [`StatusError`] mirroring its status.
pub async fn error_from_response(response: reqwest::Response) -> StatusError {
    let status = response.status();
    let body = read_body_limited(response, MAX_ERROR_BODY_BYTES).await;
    let message = if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("upstream call failed")
            .to_string()
    } else {
        String::from_utf8_lossy(&body).into_owned()
    };
    StatusError::new(status, message)
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, StatusError> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response.json::<T>().await.map_err(|e| {
        StatusError::with_context(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to decode response",
            &e,
        )
    })
}

fn transport_error(err: reqwest::Error) -> StatusError {
    let status = err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    StatusError::wrap(status, &err)
}

/// Parses an integer-seconds `Retry-After` header.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Middleware capping every request's total duration.
///
/// An existing shorter deadline (a client disconnect, an outer timeout) still
/// applies; this layer only adds an upper bound, it never extends one.
pub async fn force_max_duration(
    State(limit): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => StatusError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "request exceeded maximum duration",
        )
        .into_response(),
    }
}
