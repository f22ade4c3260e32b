//! Wire types for the Commute Live backend

use serde::Serialize;
use std::fmt;

/// Error codes the backend puts in `{"error": "..."}` bodies that the
/// client reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AccessExpired,
    RefreshInvalid,
    RefreshReused,
    InvalidCredentials,
}

impl ErrorCode {
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "ACCESS_EXPIRED" => Some(Self::AccessExpired),
            "REFRESH_INVALID" => Some(Self::RefreshInvalid),
            "REFRESH_REUSED" => Some(Self::RefreshReused),
            "INVALID_CREDENTIALS" => Some(Self::InvalidCredentials),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessExpired => "ACCESS_EXPIRED",
            Self::RefreshInvalid => "REFRESH_INVALID",
            Self::RefreshReused => "REFRESH_REUSED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
        }
    }
}

/// Refresh failures that end the session for good
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInvalidCode {
    RefreshInvalid,
    RefreshReused,
}

impl SessionInvalidCode {
    pub fn from_error_code(code: ErrorCode) -> Option<Self> {
        match code {
            ErrorCode::RefreshInvalid => Some(Self::RefreshInvalid),
            ErrorCode::RefreshReused => Some(Self::RefreshReused),
            _ => None,
        }
    }
}

impl From<SessionInvalidCode> for ErrorCode {
    fn from(code: SessionInvalidCode) -> Self {
        match code {
            SessionInvalidCode::RefreshInvalid => Self::RefreshInvalid,
            SessionInvalidCode::RefreshReused => Self::RefreshReused,
        }
    }
}

impl fmt::Display for SessionInvalidCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ErrorCode::from(*self).as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterDeviceRequest<'a> {
    pub id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDeviceRequest<'a> {
    pub device_id: &'a str,
}

/// Validated account profile from `/auth/me` or `/auth/login`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub device_ids: Vec<String>,
}

impl UserProfile {
    /// Extract the profile from a `{"user": {...}}` envelope.
    ///
    /// `id` and `email` must be strings. `deviceIds` keeps only its string
    /// entries and defaults to empty when missing or not an array.
    pub fn from_envelope(body: &serde_json::Value) -> Option<Self> {
        let user = body.get("user")?;
        let id = user.get("id")?.as_str()?.to_string();
        let email = user.get("email")?.as_str()?.to_string();
        let device_ids = user
            .get("deviceIds")
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            id,
            email,
            device_ids,
        })
    }
}
