//! Client for the display's captive portal
//!
//! While unprovisioned, the display runs its own setup access point and
//! serves a tiny HTTP API at `192.168.4.1`:
//! - `GET /status` → `{deviceId?, wifiConnected?}`
//! - `POST /connect` (form: `ssid`, `password`, `user`) → JSON, `error` on failure
//! - `GET /device-info` → `{deviceId?}`
//!
//! The portal is only reachable while the phone is still joined to that
//! access point.

pub mod poll;

use crate::api::{HttpRequest, RequestBody, Transport, TransportError};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Home network credentials handed to the display
#[derive(Debug, Clone, Default)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
    /// Only needed for enterprise networks; sent even when empty
    pub username: String,
}

impl WifiCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            username: String::new(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn can_connect(&self) -> bool {
        !self.ssid.is_empty() && !self.password.trim().is_empty()
    }

    fn form(&self) -> Vec<(String, String)> {
        vec![
            ("ssid".to_string(), self.ssid.clone()),
            ("password".to_string(), self.password.clone()),
            ("user".to_string(), self.username.clone()),
        ]
    }
}

/// Provisioning failure reported by the display; `Display` is the message
/// shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("No eligible Wi‑Fi networks found. Make sure the device can see your network.")]
    NoEligibleNetworks,
    #[error("Wrong Wi‑Fi password. Please try again.")]
    WrongPassword,
    #[error("Your Wi‑Fi network was not found. Check the SSID and try again.")]
    NetworkNotFound,
    #[error("Wrong Wi‑Fi password or SSID. Please try again.")]
    CredentialsWrong,
    #[error("Please enter a Wi‑Fi SSID.")]
    MissingSsid,
    #[error("{0}")]
    Other(String),
}

impl DeviceError {
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "No Eligible WiFi networks found" => Self::NoEligibleNetworks,
            "Failed to connect to WiFi bc of credentials" => Self::WrongPassword,
            "Target WiFi network not found" => Self::NetworkNotFound,
            "credentials wrong" => Self::CredentialsWrong,
            "Missing SSID" => Self::MissingSsid,
            other => Self::Other(other.to_string()),
        }
    }
}

/// What the display answered to a credential submission
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectReply {
    /// Raw response text, kept for troubleshooting
    pub raw: String,
    pub outcome: Result<(), DeviceError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub device_id: Option<String>,
    pub wifi_connected: Option<bool>,
    pub observed_at: DateTime<Utc>,
}

/// Truthy `error` field rendered as text, `None` when absent or falsy
fn error_field(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        other => Some(other.to_string()),
    }
}

/// `deviceId` as a string; the firmware has sent both strings and numbers
fn device_id_field(body: &Value) -> Option<String> {
    match body.get("deviceId")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct DevicePortal {
    base: String,
    transport: Arc<dyn Transport>,
}

impl DevicePortal {
    pub fn new(base_url: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
            transport,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> Result<crate::api::HttpResponse, TransportError> {
        self.transport
            .send(HttpRequest {
                method: Method::GET,
                url: self.url(path),
                body: RequestBody::Empty,
            })
            .await
    }

    /// Read the display's local status. `Ok(None)` for a non-OK or
    /// unparsable answer.
    pub async fn status(&self) -> Result<Option<StatusReport>, TransportError> {
        let resp = self.get("/status").await?;
        if !resp.is_success() {
            debug!("Portal status returned {}", resp.status);
            return Ok(None);
        }
        Ok(resp.json::<Value>().map(|body| StatusReport {
            device_id: device_id_field(&body),
            wifi_connected: body.get("wifiConnected").and_then(Value::as_bool),
            observed_at: Utc::now(),
        }))
    }

    /// Hand home Wi‑Fi credentials to the display
    pub async fn submit_wifi(
        &self,
        credentials: &WifiCredentials,
    ) -> Result<ConnectReply, TransportError> {
        info!("Submitting Wi-Fi credentials for SSID {:?}", credentials.ssid);

        let resp = self
            .transport
            .send(HttpRequest {
                method: Method::POST,
                url: self.url("/connect"),
                body: RequestBody::Form(credentials.form()),
            })
            .await?;

        // Older firmware answers in plain text; treat that as an empty object
        let body = resp.json::<Value>().unwrap_or_else(|| Value::Object(Default::default()));
        let error = error_field(&body);

        let outcome = if !resp.is_success() || error.is_some() {
            let raw = error.unwrap_or_else(|| "Unknown error".to_string());
            warn!("Device rejected Wi-Fi credentials ({}): {}", resp.status, raw);
            Err(DeviceError::from_raw(&raw))
        } else {
            Ok(())
        };

        Ok(ConnectReply {
            raw: resp.body,
            outcome,
        })
    }

    /// Best-effort device id lookup; every failure yields `None`
    pub async fn device_info(&self) -> Option<String> {
        match self.get("/device-info").await {
            Ok(resp) if resp.is_success() => resp.json::<Value>().and_then(|b| device_id_field(&b)),
            Ok(resp) => {
                debug!("Device info returned {}", resp.status);
                None
            }
            Err(e) => {
                debug!("Device info unavailable: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedTransport;

    fn portal(transport: &Arc<ScriptedTransport>) -> DevicePortal {
        DevicePortal::new("http://192.168.4.1/", transport.clone())
    }

    #[test]
    fn test_can_connect_requires_ssid_and_password() {
        assert!(WifiCredentials::new("home", "secret").can_connect());
        assert!(!WifiCredentials::new("", "secret").can_connect());
        assert!(!WifiCredentials::new("home", "   ").can_connect());
        assert!(WifiCredentials::new("home", " s ").with_username("").can_connect());
    }

    #[test]
    fn test_device_error_mapping() {
        let cases = [
            (
                "No Eligible WiFi networks found",
                DeviceError::NoEligibleNetworks,
                "No eligible Wi‑Fi networks found. Make sure the device can see your network.",
            ),
            (
                "Failed to connect to WiFi bc of credentials",
                DeviceError::WrongPassword,
                "Wrong Wi‑Fi password. Please try again.",
            ),
            (
                "Target WiFi network not found",
                DeviceError::NetworkNotFound,
                "Your Wi‑Fi network was not found. Check the SSID and try again.",
            ),
            (
                "credentials wrong",
                DeviceError::CredentialsWrong,
                "Wrong Wi‑Fi password or SSID. Please try again.",
            ),
            ("Missing SSID", DeviceError::MissingSsid, "Please enter a Wi‑Fi SSID."),
        ];
        for (raw, expected, message) in cases {
            let mapped = DeviceError::from_raw(raw);
            assert_eq!(mapped.to_string(), message, "message for {:?}", raw);
            assert_eq!(mapped, expected);
        }
        assert_eq!(DeviceError::from_raw("boom").to_string(), "boom");
        assert_eq!(
            DeviceError::from_raw("Credentials Wrong"),
            DeviceError::Other("Credentials Wrong".to_string())
        );
    }

    #[tokio::test]
    async fn test_submit_sends_form_with_empty_username() {
        let transport = ScriptedTransport::new();
        transport.respond(200, r#"{"status":"ok"}"#);

        let reply = portal(&transport)
            .submit_wifi(&WifiCredentials::new("home", "pw"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, Ok(()));

        let request = &transport.requests()[0];
        assert_eq!(request.url, "http://192.168.4.1/connect");
        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.body,
            RequestBody::Form(vec![
                ("ssid".to_string(), "home".to_string()),
                ("password".to_string(), "pw".to_string()),
                ("user".to_string(), String::new()),
            ])
        );
    }

    #[tokio::test]
    async fn test_submit_failures() {
        let transport = ScriptedTransport::new();
        transport
            .respond(200, r#"{"error":"Target WiFi network not found"}"#)
            .respond(500, "internal")
            .respond(200, "connecting...");
        let portal = portal(&transport);
        let creds = WifiCredentials::new("home", "pw");

        let not_found = portal.submit_wifi(&creds).await.unwrap();
        assert_eq!(not_found.outcome, Err(DeviceError::NetworkNotFound));

        let unknown = portal.submit_wifi(&creds).await.unwrap();
        assert_eq!(unknown.outcome, Err(DeviceError::Other("Unknown error".to_string())));
        assert_eq!(unknown.raw, "internal");

        let text_ok = portal.submit_wifi(&creds).await.unwrap();
        assert_eq!(text_ok.outcome, Ok(()));
    }

    #[tokio::test]
    async fn test_status_parsing() {
        let transport = ScriptedTransport::new();
        transport
            .respond(200, r#"{"deviceId":"CL-42","wifiConnected":false}"#)
            .respond(200, r#"{"deviceId":1234}"#)
            .respond(503, "busy");
        let portal = portal(&transport);

        let report = portal.status().await.unwrap().unwrap();
        assert_eq!(report.device_id.as_deref(), Some("CL-42"));
        assert_eq!(report.wifi_connected, Some(false));

        let numeric = portal.status().await.unwrap().unwrap();
        assert_eq!(numeric.device_id.as_deref(), Some("1234"));
        assert_eq!(numeric.wifi_connected, None);

        assert_eq!(portal.status().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_device_info_is_best_effort() {
        let transport = ScriptedTransport::new();
        transport
            .respond(200, r#"{"deviceId":"CL-42"}"#)
            .respond(404, "")
            .respond(200, r#"{"deviceId":""}"#)
            .fail();
        let portal = portal(&transport);

        assert_eq!(portal.device_info().await.as_deref(), Some("CL-42"));
        assert_eq!(portal.device_info().await, None);
        assert_eq!(portal.device_info().await, None);
        assert_eq!(portal.device_info().await, None);
    }
}
