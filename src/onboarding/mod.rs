//! Display onboarding: Wi‑Fi hand-off, then register + link
//!
//! 1. POST home Wi‑Fi credentials to the display's captive portal
//! 2. Map any device-reported error to a user message and stop
//! 3. Resolve the device id (from the initial `/status` read, else
//!    `/device-info`)
//! 4. Register the device and link it to the signed-in account
//!
//! Step 4 needs the backend, which the phone can usually reach only after
//! leaving the display's setup network. A transport failure there is the
//! expected handover, not an error: the flow parks the device id and waits
//! for the user to confirm they switched networks, then [`OnboardingFlow::retry_link`]
//! re-runs step 4 alone. Nothing here retries on its own.

use crate::api::types::{LinkDeviceRequest, RegisterDeviceRequest};
use crate::api::{ApiClient, ApiError, HttpResponse, LINK_DEVICE_PATH, REGISTER_DEVICE_PATH};
use crate::auth::{AuthSession, DeviceSource, DeviceStatus};
use crate::device::poll::apply_status;
use crate::device::{DevicePortal, WifiCredentials};
use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const HANDOVER_MESSAGE: &str =
    "Now switch your phone from the display's setup Wi-Fi to home Wi-Fi or cellular, then tap \"I have done it\".";
pub const PORTAL_DROPPED_MESSAGE: &str =
    "Connection to the display's setup Wi-Fi dropped. This often means the display switched networks. Switch your phone to home Wi-Fi or cellular, then tap \"I have done it\".";
pub const NETWORK_ERROR_MESSAGE: &str = "Network error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectStatus {
    #[default]
    Idle,
    Connecting,
    Success,
    Error,
}

/// Ephemeral per-flow state, rebuilt for every flow instance
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OnboardingState {
    pub connect_status: ConnectStatus,
    /// User-facing error or guidance text
    pub message: Option<String>,
    /// Raw text of the last `/connect` answer
    pub device_response: Option<String>,
    /// Device waiting for a user-confirmed link retry
    pub pending_link_device_id: Option<String>,
    pub needs_home_wifi_for_link: bool,
}

/// Coarse reading of [`OnboardingState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnboardingPhase {
    Idle,
    Connecting,
    Failed(String),
    /// Wi‑Fi configured; linking done or not possible without an id
    Configured,
    /// Wi‑Fi configured, link parked until the phone is back online
    AwaitingHomeNetwork { device_id: String },
}

impl OnboardingState {
    pub fn phase(&self) -> OnboardingPhase {
        match self.connect_status {
            ConnectStatus::Idle => OnboardingPhase::Idle,
            ConnectStatus::Connecting => OnboardingPhase::Connecting,
            ConnectStatus::Error => OnboardingPhase::Failed(self.message.clone().unwrap_or_default()),
            ConnectStatus::Success => match (&self.pending_link_device_id, self.needs_home_wifi_for_link) {
                (Some(id), true) => OnboardingPhase::AwaitingHomeNetwork {
                    device_id: id.clone(),
                },
                _ => OnboardingPhase::Configured,
            },
        }
    }

    fn clear_pending(&mut self) {
        self.pending_link_device_id = None;
        self.needs_home_wifi_for_link = false;
    }

    fn park(&mut self, device_id: &str, message: &str) {
        self.pending_link_device_id = Some(device_id.to_string());
        self.needs_home_wifi_for_link = true;
        self.connect_status = ConnectStatus::Success;
        self.message = Some(message.to_string());
    }

    fn fail(&mut self, message: String) {
        self.clear_pending();
        self.connect_status = ConnectStatus::Error;
        self.message = Some(message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Account already has the device; no backend call was made
    AlreadyLinked(DeviceSource),
    Linked,
    /// Backend refused; message is in the flow state
    Rejected,
    /// Backend unreachable; parked for a manual retry
    AwaitingHomeNetwork,
}

#[derive(Debug, Error)]
enum LinkError {
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Unreachable(#[from] ApiError),
}

fn rejection(prefix: &str, resp: &HttpResponse) -> String {
    match resp.error_code() {
        Some(error) => format!("{}: {}", prefix, error),
        None => format!("{} ({})", prefix, resp.status.as_u16()),
    }
}

pub struct OnboardingFlow {
    api: Arc<ApiClient>,
    portal: Arc<DevicePortal>,
    session: Arc<AuthSession>,
    /// Id the display itself reported, never the account's selection
    portal_device_id: Option<String>,
    state: OnboardingState,
}

impl OnboardingFlow {
    /// Start a fresh flow. Marks the pairing indicator "not paired" until
    /// the display reports otherwise.
    pub fn new(api: Arc<ApiClient>, portal: Arc<DevicePortal>, session: Arc<AuthSession>) -> Self {
        session.set_device_status(DeviceStatus::NotPaired);
        Self {
            api,
            portal,
            session,
            portal_device_id: None,
            state: OnboardingState::default(),
        }
    }

    pub fn state(&self) -> &OnboardingState {
        &self.state
    }

    /// One read of the display's `/status` while the phone is on its setup
    /// network. Updates the pairing indicator and remembers the reported
    /// id; failures leave everything as it was.
    pub async fn read_portal_status(&mut self) -> Option<String> {
        match self.portal.status().await {
            Ok(Some(report)) => {
                apply_status(&self.session, &report);
                if report.device_id.is_some() {
                    self.portal_device_id = report.device_id;
                }
            }
            Ok(None) => debug!("Display status carried nothing usable"),
            Err(e) => debug!("Display status unavailable: {}", e),
        }
        self.portal_device_id.clone()
    }

    /// Run the whole flow for one set of credentials. Incomplete
    /// credentials are ignored and leave the state untouched.
    pub async fn connect(&mut self, credentials: &WifiCredentials) -> &OnboardingState {
        if !credentials.can_connect() {
            debug!("Wi-Fi name or password missing, not contacting the display");
            return &self.state;
        }

        self.state = OnboardingState {
            connect_status: ConnectStatus::Connecting,
            ..OnboardingState::default()
        };

        let reply = match self.portal.submit_wifi(credentials).await {
            Ok(reply) => reply,
            Err(e) => {
                // A drop here after the display already knows us is usually
                // the display leaving its setup network
                match self.portal_device_id.clone() {
                    Some(known) => {
                        warn!("Portal dropped mid-request ({}), parking link for {}", e, known);
                        self.state.park(&known, PORTAL_DROPPED_MESSAGE);
                    }
                    None => {
                        warn!("Display portal unreachable: {}", e);
                        self.state.fail(NETWORK_ERROR_MESSAGE.to_string());
                    }
                }
                return &self.state;
            }
        };

        self.state.device_response = Some(reply.raw);
        if let Err(device_error) = reply.outcome {
            self.state.fail(device_error.to_string());
            return &self.state;
        }

        if self.portal_device_id.is_none() {
            self.portal_device_id = self.portal.device_info().await;
        }
        let device_id = self.portal_device_id.clone();
        if device_id.is_some() {
            self.session.set_device_id(device_id.clone());
        }

        self.state.connect_status = ConnectStatus::Success;
        match device_id {
            Some(id) => {
                info!("Wi-Fi configured on display {}, linking", id);
                self.try_register_and_link(&id).await;
            }
            None => info!("Wi-Fi configured; no device id available, skipping link"),
        }
        &self.state
    }

    /// Register `device_id` and link it to the account
    pub async fn try_register_and_link(&mut self, device_id: &str) -> LinkOutcome {
        if let Some(source) = self.session.device_source(device_id) {
            debug!("Device {} already linked ({:?})", device_id, source);
            self.state.clear_pending();
            self.state.message = None;
            self.session.set_device_status(DeviceStatus::PairedOnline);
            return LinkOutcome::AlreadyLinked(source);
        }

        match self.register_and_link(device_id).await {
            Ok(()) => {
                info!("Device {} linked to account", device_id);
                self.state.clear_pending();
                self.state.message = None;
                self.session.mark_device_linked(device_id);
                LinkOutcome::Linked
            }
            Err(LinkError::Rejected(message)) => {
                warn!("Linking device {} failed: {}", device_id, message);
                self.state.fail(message);
                LinkOutcome::Rejected
            }
            Err(LinkError::Unreachable(e)) => {
                info!("Backend unreachable during link ({}), waiting for network switch", e);
                self.state.park(device_id, HANDOVER_MESSAGE);
                LinkOutcome::AwaitingHomeNetwork
            }
        }
    }

    /// User confirmed the phone is back on home Wi‑Fi or cellular.
    /// Re-runs register + link for the parked device; `None` when nothing
    /// is parked.
    pub async fn retry_link(&mut self) -> Option<LinkOutcome> {
        let device_id = self.state.pending_link_device_id.clone()?;
        self.state.message = None;
        self.state.connect_status = ConnectStatus::Success;
        Some(self.try_register_and_link(&device_id).await)
    }

    async fn register_and_link(&self, device_id: &str) -> Result<(), LinkError> {
        let register = self
            .api
            .post_json(REGISTER_DEVICE_PATH, &RegisterDeviceRequest { id: device_id })
            .await?;
        // 409: already registered
        if !register.is_success() && register.status != StatusCode::CONFLICT {
            return Err(LinkError::Rejected(rejection("Device register failed", &register)));
        }

        let link = self
            .api
            .post_json(LINK_DEVICE_PATH, &LinkDeviceRequest { device_id })
            .await?;
        if !link.is_success() {
            return Err(LinkError::Rejected(rejection(
                "Wi-Fi connected, but device link failed",
                &link,
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedTransport;
    use crate::api::RequestBody;
    use serde_json::json;
    use tokio_test::assert_ok;

    struct Harness {
        portal: Arc<ScriptedTransport>,
        backend: Arc<ScriptedTransport>,
        session: Arc<AuthSession>,
        flow: OnboardingFlow,
    }

    /// Authenticated session whose profile lists `device_ids`
    async fn harness(device_ids: &[&str]) -> Harness {
        let portal = ScriptedTransport::new();
        let backend = ScriptedTransport::new();
        backend.respond(
            200,
            &json!({"user": {"id": "u1", "email": "rider@example.test", "deviceIds": device_ids}})
                .to_string(),
        );
        let api = Arc::new(ApiClient::new("https://api.example.test", backend.clone()));
        let session = AuthSession::start(api.clone()).await;
        let device_portal = Arc::new(DevicePortal::new("http://192.168.4.1", portal.clone()));
        let flow = OnboardingFlow::new(api, device_portal, session.clone());
        Harness {
            portal,
            backend,
            session,
            flow,
        }
    }

    fn creds() -> WifiCredentials {
        WifiCredentials::new("home", "secret")
    }

    #[tokio::test]
    async fn test_new_flow_marks_not_paired() {
        let h = harness(&["A"]).await;
        assert_eq!(h.session.snapshot().device_status, DeviceStatus::NotPaired);
        assert_eq!(h.flow.state().phase(), OnboardingPhase::Idle);
    }

    #[tokio::test]
    async fn test_full_flow_registers_and_links() {
        let mut h = harness(&[]).await;
        h.portal
            .respond(200, r#"{"status":"connecting"}"#)
            .respond(200, r#"{"deviceId":"CL-1"}"#);
        h.backend.respond(201, "{}").respond(200, "{}");

        let state = h.flow.connect(&creds()).await.clone();

        assert_eq!(state.connect_status, ConnectStatus::Success);
        assert_eq!(state.message, None);
        assert_eq!(state.device_response.as_deref(), Some(r#"{"status":"connecting"}"#));
        assert_eq!(state.phase(), OnboardingPhase::Configured);

        let session = h.session.snapshot();
        assert_eq!(session.device_id.as_deref(), Some("CL-1"));
        assert_eq!(session.device_status, DeviceStatus::PairedOnline);
        assert_eq!(h.session.device_source("CL-1"), Some(DeviceSource::Local));

        let requests = h.backend.requests();
        assert_eq!(requests[1].url, "https://api.example.test/device/register");
        assert_eq!(requests[1].body, RequestBody::Json(json!({"id": "CL-1"})));
        assert_eq!(requests[2].url, "https://api.example.test/user/device/link");
        assert_eq!(requests[2].body, RequestBody::Json(json!({"deviceId": "CL-1"})));
    }

    #[tokio::test]
    async fn test_conflict_on_register_is_accepted() {
        let mut h = harness(&[]).await;
        h.backend.respond(409, r#"{"error":"DEVICE_EXISTS"}"#).respond(200, "{}");

        assert_eq!(h.flow.try_register_and_link("CL-1").await, LinkOutcome::Linked);
    }

    #[tokio::test]
    async fn test_device_reported_errors_are_mapped() {
        let mut h = harness(&[]).await;
        h.portal
            .respond(200, r#"{"error":"Failed to connect to WiFi bc of credentials"}"#)
            .respond(200, r#"{"error":"boom"}"#);

        let state = h.flow.connect(&creds()).await.clone();
        assert_eq!(state.connect_status, ConnectStatus::Error);
        assert_eq!(state.message.as_deref(), Some("Wrong Wi‑Fi password. Please try again."));

        let state = h.flow.connect(&creds()).await.clone();
        assert_eq!(state.phase(), OnboardingPhase::Failed("boom".to_string()));
        assert_eq!(h.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_never_reach_the_portal() {
        let mut h = harness(&[]).await;

        let state = h.flow.connect(&WifiCredentials::new("home", "  ")).await;
        assert_eq!(state.phase(), OnboardingPhase::Idle);
        assert_eq!(state.message, None);
        assert_eq!(h.portal.call_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_credentials_keep_parked_link() {
        let mut h = harness(&[]).await;
        h.backend.fail();
        assert_eq!(
            h.flow.try_register_and_link("CL-1").await,
            LinkOutcome::AwaitingHomeNetwork
        );

        let state = h.flow.connect(&WifiCredentials::new("", "secret")).await.clone();
        assert_eq!(
            state.phase(),
            OnboardingPhase::AwaitingHomeNetwork {
                device_id: "CL-1".to_string()
            }
        );
        assert_eq!(state.message.as_deref(), Some(HANDOVER_MESSAGE));

        h.backend.respond(201, "{}").respond(200, "{}");
        assert_eq!(h.flow.retry_link().await, Some(LinkOutcome::Linked));
        assert_eq!(h.portal.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_device_id_stops_after_wifi() {
        let mut h = harness(&[]).await;
        h.portal.respond(200, "{}").fail();

        let state = h.flow.connect(&creds()).await.clone();
        assert_eq!(state.connect_status, ConnectStatus::Success);
        assert_eq!(state.pending_link_device_id, None);
        assert_eq!(h.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_portal_without_known_device_is_terminal() {
        let mut h = harness(&[]).await;
        h.portal.fail();

        let state = h.flow.connect(&creds()).await.clone();
        assert_eq!(state.connect_status, ConnectStatus::Error);
        assert_eq!(state.message.as_deref(), Some(NETWORK_ERROR_MESSAGE));
    }

    #[tokio::test]
    async fn test_portal_drop_with_known_device_parks_link() {
        let mut h = harness(&[]).await;
        h.portal
            .respond(200, r#"{"deviceId":"CL-5","wifiConnected":false}"#)
            .fail();
        assert_eq!(h.flow.read_portal_status().await.as_deref(), Some("CL-5"));

        let state = h.flow.connect(&creds()).await.clone();
        assert_eq!(
            state.phase(),
            OnboardingPhase::AwaitingHomeNetwork {
                device_id: "CL-5".to_string()
            }
        );
        assert_eq!(state.message.as_deref(), Some(PORTAL_DROPPED_MESSAGE));
    }

    #[tokio::test]
    async fn test_handover_parks_then_manual_retry_completes() {
        let mut h = harness(&[]).await;
        h.portal
            .respond(200, "{}")
            .respond(200, r#"{"deviceId":"CL-1"}"#);
        h.backend.fail();

        let state = h.flow.connect(&creds()).await.clone();
        assert_eq!(state.connect_status, ConnectStatus::Success);
        assert!(state.needs_home_wifi_for_link);
        assert_eq!(state.pending_link_device_id.as_deref(), Some("CL-1"));
        assert_eq!(state.message.as_deref(), Some(HANDOVER_MESSAGE));

        h.backend.respond(201, "{}").respond(200, "{}");
        let outcome = h.flow.retry_link().await;

        assert_eq!(outcome, Some(LinkOutcome::Linked));
        let state = h.flow.state();
        assert!(!state.needs_home_wifi_for_link);
        assert_eq!(state.pending_link_device_id, None);
        assert_eq!(state.phase(), OnboardingPhase::Configured);
        assert_eq!(h.session.snapshot().device_status, DeviceStatus::PairedOnline);
        // Credentials were not re-sent
        assert_eq!(h.portal.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_retry_surfaces_error_and_clears_pause() {
        let mut h = harness(&[]).await;
        h.backend.fail();
        assert_eq!(
            h.flow.try_register_and_link("CL-1").await,
            LinkOutcome::AwaitingHomeNetwork
        );

        h.backend.respond(201, "{}").respond(403, r#"{"error":"DEVICE_OWNED"}"#);
        assert_eq!(h.flow.retry_link().await, Some(LinkOutcome::Rejected));

        let state = h.flow.state();
        assert_eq!(state.connect_status, ConnectStatus::Error);
        assert!(!state.needs_home_wifi_for_link);
        assert_eq!(state.pending_link_device_id, None);
        assert_eq!(
            state.message.as_deref(),
            Some("Wi-Fi connected, but device link failed: DEVICE_OWNED")
        );
        assert_eq!(h.flow.retry_link().await, None);
    }

    #[tokio::test]
    async fn test_register_rejection_messages() {
        let mut h = harness(&[]).await;
        h.backend
            .respond(500, r#"{"error":"db down"}"#)
            .respond(502, "Bad Gateway");

        assert_eq!(h.flow.try_register_and_link("CL-1").await, LinkOutcome::Rejected);
        assert_eq!(h.flow.state().message.as_deref(), Some("Device register failed: db down"));

        assert_eq!(h.flow.try_register_and_link("CL-1").await, LinkOutcome::Rejected);
        assert_eq!(h.flow.state().message.as_deref(), Some("Device register failed (502)"));
    }

    #[tokio::test]
    async fn test_known_device_links_without_backend_calls() {
        let mut h = harness(&["CL-1"]).await;
        let calls_before = h.backend.call_count();

        let outcome = h.flow.try_register_and_link("CL-1").await;

        assert_eq!(outcome, LinkOutcome::AlreadyLinked(DeviceSource::Server));
        assert_eq!(h.backend.call_count(), calls_before);
        assert_eq!(h.session.snapshot().device_status, DeviceStatus::PairedOnline);
    }

    #[tokio::test]
    async fn test_second_display_is_linked_not_mistaken_for_first() {
        let mut h = harness(&["A"]).await;
        assert_eq!(h.session.device_id().as_deref(), Some("A"));
        h.portal.respond(200, "{}").respond(200, r#"{"deviceId":"NEW"}"#);
        h.backend.respond(201, "{}").respond(200, "{}");

        let state = h.flow.connect(&creds()).await.clone();

        assert_eq!(state.phase(), OnboardingPhase::Configured);
        assert_eq!(h.portal.urls()[1], "http://192.168.4.1/device-info");
        assert_eq!(h.backend.call_count(), 3);
        assert_eq!(
            h.backend.requests()[1].body,
            RequestBody::Json(json!({"id": "NEW"}))
        );
        assert_eq!(h.session.device_id().as_deref(), Some("NEW"));
        assert_eq!(h.session.device_source("NEW"), Some(DeviceSource::Local));
    }

    #[tokio::test]
    async fn test_status_read_id_skips_device_info() {
        let mut h = harness(&["A"]).await;
        h.portal
            .respond(200, r#"{"deviceId":"CL-7","wifiConnected":true}"#)
            .respond(200, "{}");
        h.backend.respond(201, "{}").respond(200, "{}");

        let id = assert_ok!(h.flow.read_portal_status().await.ok_or("no device id"));
        assert_eq!(id, "CL-7");
        assert_eq!(h.session.snapshot().device_status, DeviceStatus::PairedOnline);

        h.flow.connect(&creds()).await;

        assert_eq!(h.portal.call_count(), 2);
        assert_eq!(
            h.backend.requests()[2].body,
            RequestBody::Json(json!({"deviceId": "CL-7"}))
        );
    }

    #[tokio::test]
    async fn test_failed_status_read_is_ignored() {
        let mut h = harness(&["A"]).await;
        h.portal.fail();

        assert_eq!(h.flow.read_portal_status().await, None);
        assert_eq!(h.session.snapshot().device_status, DeviceStatus::NotPaired);
        assert_eq!(h.flow.state().phase(), OnboardingPhase::Idle);
    }
}
