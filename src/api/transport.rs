//! HTTP transport seam shared by the backend client and the device portal
//!
//! Flows talk to a [`Transport`] rather than to `reqwest` directly so they
//! can be driven by a scripted transport in tests.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure to get any HTTP response at all (DNS, connect, timeout, reset)
#[derive(Debug, Clone, Error)]
#[error("network error: {0}")]
pub struct TransportError(pub String);

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// A fully resolved outbound request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: RequestBody,
}

/// Buffered response: status plus the raw body text
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Parse the body as JSON, `None` if it isn't valid for `T`
    pub fn json<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_str(&self.body).ok()
    }

    /// The `error` string of a `{"error": "..."}` body, if there is one
    pub fn error_code(&self) -> Option<String> {
        self.json::<serde_json::Value>()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// `reqwest`-backed transport
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    /// Client that keeps session cookies between calls (backend API)
    pub fn with_cookies(timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .user_agent(concat!("commute-live/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    /// Cookie-less client for the device's captive portal
    pub fn plain(timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!("{} {}", request.method, request.url);

        let builder = self.http.request(request.method, &request.url);
        let builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(fields) => builder.form(&fields),
        };

        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(HttpResponse::new(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_extraction() {
        let resp = HttpResponse::new(StatusCode::UNAUTHORIZED, r#"{"error":"ACCESS_EXPIRED"}"#);
        assert_eq!(resp.error_code().as_deref(), Some("ACCESS_EXPIRED"));

        let not_json = HttpResponse::new(StatusCode::UNAUTHORIZED, "<html>nope</html>");
        assert_eq!(not_json.error_code(), None);

        let non_string = HttpResponse::new(StatusCode::BAD_REQUEST, r#"{"error":42}"#);
        assert_eq!(non_string.error_code(), None);
    }

    #[test]
    fn test_transports_build() {
        assert!(ReqwestTransport::with_cookies(Duration::from_secs(5)).is_ok());
        assert!(ReqwestTransport::plain(Duration::from_secs(5)).is_ok());
    }
}
