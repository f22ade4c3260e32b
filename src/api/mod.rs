//! Authenticated client for the Commute Live backend
//!
//! Every backend call goes through [`ApiClient::fetch`]:
//! 1. Resolve the path against the configured base URL
//! 2. Send it with the shared session cookies
//! 3. On a `401 ACCESS_EXPIRED`, POST `/auth/refresh` and retry once
//! 4. On `REFRESH_INVALID` / `REFRESH_REUSED`, notify the session-invalid
//!    handler and hand the refresh response back to the caller
//!
//! HTTP-level failures are always returned as responses. Only a transport
//! failure of the original request surfaces as an error.

#[cfg(test)]
pub mod testing;
pub mod transport;
pub mod types;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use transport::{HttpRequest, HttpResponse, RequestBody, Transport, TransportError};
use types::{ErrorCode, SessionInvalidCode};

pub const LOGIN_PATH: &str = "/auth/login";
pub const ME_PATH: &str = "/auth/me";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const REGISTER_DEVICE_PATH: &str = "/device/register";
pub const LINK_DEVICE_PATH: &str = "/user/device/link";

/// Endpoints that must never trigger a refresh themselves
const NO_REFRESH_SUFFIXES: [&str; 3] = [LOGIN_PATH, REFRESH_PATH, LOGOUT_PATH];

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode request body: {0}")]
    Encode(String),
}

/// Called when the refresh token is rejected for good
pub type SessionInvalidHandler = Arc<dyn Fn(SessionInvalidCode) + Send + Sync>;

/// Backend base URL, trailing slashes stripped once at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiBase(String);

impl ApiBase {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim_end_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute `http(s)://` URLs pass through; anything else is joined to
    /// the base with exactly one slash.
    pub fn resolve(&self, input: &str) -> String {
        if is_absolute_http(input) {
            return input.to_string();
        }
        format!("{}/{}", self.0, input.trim_start_matches('/'))
    }

    /// Whether a 401 on `url` may be answered with a token refresh
    pub fn should_refresh(&self, url: &str) -> bool {
        url.starts_with(&self.0) && !NO_REFRESH_SUFFIXES.iter().any(|s| url.ends_with(s))
    }
}

fn is_absolute_http(input: &str) -> bool {
    let prefix: String = input.chars().take(8).collect::<String>().to_ascii_lowercase();
    prefix.starts_with("http://") || prefix.starts_with("https://")
}

/// Method and body of a backend call, reused verbatim for the retry
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: RequestBody::Empty,
        }
    }

    pub fn post() -> Self {
        Self {
            method: Method::POST,
            body: RequestBody::Empty,
        }
    }

    pub fn post_json<T: Serialize>(body: &T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body).map_err(|e| ApiError::Encode(e.to_string()))?;
        Ok(Self {
            method: Method::POST,
            body: RequestBody::Json(value),
        })
    }
}

pub struct ApiClient {
    base: ApiBase,
    transport: Arc<dyn Transport>,
    session_invalid: RwLock<Option<SessionInvalidHandler>>,
}

impl ApiClient {
    pub fn new(base_url: &str, transport: Arc<dyn Transport>) -> Self {
        let base = ApiBase::new(base_url);
        info!("API client configured for {}", base.as_str());
        Self {
            base,
            transport,
            session_invalid: RwLock::new(None),
        }
    }

    /// Install (or clear, with `None`) the session-invalid handler.
    /// A new handler replaces the previous one.
    pub fn set_session_invalid_handler(&self, handler: Option<SessionInvalidHandler>) {
        let mut slot = self
            .session_invalid
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = handler;
    }

    /// Perform a backend call with transparent access-token refresh
    pub async fn fetch(&self, path: &str, request: ApiRequest) -> Result<HttpResponse, ApiError> {
        let url = self.base.resolve(path);
        let response = self.send(&url, &request).await?;

        if response.status != StatusCode::UNAUTHORIZED || !self.base.should_refresh(&url) {
            return Ok(response);
        }

        if response.error_code().as_deref().and_then(ErrorCode::parse)
            != Some(ErrorCode::AccessExpired)
        {
            return Ok(response);
        }

        debug!("Access token expired for {}, refreshing session", url);

        let refresh_url = self.base.resolve(REFRESH_PATH);
        let refresh = match self.send(&refresh_url, &ApiRequest::post()).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Session refresh failed ({}), returning original response", e);
                return Ok(response);
            }
        };

        if !refresh.is_success() {
            let code = refresh
                .error_code()
                .as_deref()
                .and_then(ErrorCode::parse)
                .and_then(SessionInvalidCode::from_error_code);
            if let Some(code) = code {
                warn!("Session invalidated by backend: {}", code);
                self.notify_session_invalid(code);
            } else {
                debug!("Session refresh rejected with status {}", refresh.status);
            }
            return Ok(refresh);
        }

        debug!("Session refreshed, retrying {}", url);
        Ok(self.send(&url, &request).await?)
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse, ApiError> {
        self.fetch(path, ApiRequest::get()).await
    }

    pub async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<HttpResponse, ApiError> {
        self.fetch(path, ApiRequest::post_json(body)?).await
    }

    async fn send(&self, url: &str, request: &ApiRequest) -> Result<HttpResponse, TransportError> {
        self.transport
            .send(HttpRequest {
                method: request.method.clone(),
                url: url.to_string(),
                body: request.body.clone(),
            })
            .await
    }

    fn notify_session_invalid(&self, code: SessionInvalidCode) {
        // Clone out of the lock so the handler may re-register itself
        let handler = self
            .session_invalid
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(code);
        }
    }
}
