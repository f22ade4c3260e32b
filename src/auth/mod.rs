//! Account session state machine
//!
//! `Loading → {Authenticated, Unauthenticated}`, with sign-in, sign-out and
//! refresh invalidation moving between the two. `hydrate()` re-enters
//! `Loading` while it runs.
//!
//! The session also owns the selected device and the coarse pairing
//! indicator that onboarding and the dashboard read. State changes are
//! published through a `watch` channel, see [`AuthSession::subscribe`].

use crate::api::types::{ErrorCode, LoginRequest, SessionInvalidCode, UserProfile};
use crate::api::{ApiClient, ApiError, ApiRequest, LOGIN_PATH, LOGOUT_PATH, ME_PATH};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Loading,
    Authenticated,
    Unauthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

/// Coarse pairing indicator shown by onboarding and dashboard screens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    NotPaired,
    PairedOnline,
    PairedOffline,
}

/// Where a device id's account membership is known from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSource {
    /// Listed in the last profile the backend sent
    Server,
    /// Linked from this client since the last profile, not yet confirmed
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub status: AuthStatus,
    pub user: Option<AuthUser>,
    /// Server-confirmed device ids, in server order
    pub device_ids: Vec<String>,
    /// Ids linked locally that no profile has confirmed yet
    pub locally_linked: Vec<String>,
    pub device_id: Option<String>,
    pub device_status: DeviceStatus,
}

/// Display summary of the selected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedDevice {
    pub id: String,
    pub name: String,
    pub online: bool,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            status: AuthStatus::Loading,
            user: None,
            device_ids: Vec::new(),
            locally_linked: Vec::new(),
            device_id: None,
            device_status: DeviceStatus::NotPaired,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == AuthStatus::Authenticated
    }

    pub fn device_source(&self, device_id: &str) -> Option<DeviceSource> {
        if self.device_ids.iter().any(|id| id == device_id) {
            Some(DeviceSource::Server)
        } else if self.locally_linked.iter().any(|id| id == device_id) {
            Some(DeviceSource::Local)
        } else {
            None
        }
    }

    pub fn selected_device(&self) -> Option<SelectedDevice> {
        self.device_id.as_ref().map(|id| SelectedDevice {
            id: id.clone(),
            name: format!("Device {}", id),
            online: self.device_status == DeviceStatus::PairedOnline,
        })
    }
}

/// Keep `current` if the profile still lists it, else take the first id
fn reconcile_selection(current: Option<&str>, device_ids: &[String]) -> Option<String> {
    match current {
        Some(id) if device_ids.iter().any(|d| d == id) => Some(id.to_string()),
        _ => device_ids.first().cloned(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedIn {
    pub user: AuthUser,
    pub device_ids: Vec<String>,
}

/// Sign-in failure; `Display` is the user-facing message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignInError {
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Login failed")]
    Rejected,
    #[error("Network error")]
    Network,
}

pub struct AuthSession {
    api: Arc<ApiClient>,
    state: watch::Sender<SessionState>,
}

impl AuthSession {
    /// Create a session in `Loading` without contacting the backend
    pub fn new(api: Arc<ApiClient>) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::initial());
        Arc::new(Self { api, state })
    }

    /// Create a session and hydrate it once
    pub async fn start(api: Arc<ApiClient>) -> Arc<Self> {
        let session = Self::new(api);
        session.hydrate().await;
        session
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.state.borrow().device_id.clone()
    }

    pub fn device_source(&self, device_id: &str) -> Option<DeviceSource> {
        self.state.borrow().device_source(device_id)
    }

    /// Reload the profile from `/auth/me`; any failure signs out locally
    pub async fn hydrate(&self) {
        self.state.send_modify(|s| s.status = AuthStatus::Loading);

        let response = match self.api.get(ME_PATH).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Session hydration failed: {}", e);
                self.clear_auth();
                return;
            }
        };

        let profile = response
            .json::<serde_json::Value>()
            .and_then(|body| UserProfile::from_envelope(&body));

        match profile {
            Some(profile) if response.is_success() => {
                debug!("Session hydrated for {}", profile.email);
                self.apply_profile(profile);
            }
            _ => {
                debug!("No valid session (status {})", response.status);
                self.clear_auth();
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignedIn, SignInError> {
        let email = email.trim();
        let response = match self
            .api
            .post_json(LOGIN_PATH, &LoginRequest { email, password })
            .await
        {
            Ok(resp) => resp,
            Err(ApiError::Transport(e)) => {
                warn!("Sign-in request failed: {}", e);
                return Err(SignInError::Network);
            }
            Err(e) => {
                warn!("Sign-in request not sent: {}", e);
                return Err(SignInError::Rejected);
            }
        };

        let body = response.json::<serde_json::Value>();
        let profile = body.as_ref().and_then(UserProfile::from_envelope);

        match profile {
            Some(profile) if response.is_success() => {
                info!("Signed in as {}", profile.email);
                let signed_in = SignedIn {
                    user: AuthUser {
                        id: profile.id.clone(),
                        email: profile.email.clone(),
                    },
                    device_ids: profile.device_ids.clone(),
                };
                self.apply_profile(profile);
                Ok(signed_in)
            }
            _ => {
                let code = body
                    .as_ref()
                    .and_then(|b| b.get("error"))
                    .and_then(|e| e.as_str());
                info!("Sign-in rejected with status {}", response.status);
                if code.and_then(ErrorCode::parse) == Some(ErrorCode::InvalidCredentials) {
                    Err(SignInError::InvalidCredentials)
                } else {
                    Err(SignInError::Rejected)
                }
            }
        }
    }

    /// Best-effort logout call; local state is cleared regardless
    pub async fn sign_out(&self) {
        match self.api.fetch(LOGOUT_PATH, ApiRequest::post()).await {
            Ok(resp) if !resp.is_success() => debug!("Logout returned {}", resp.status),
            Ok(_) => {}
            Err(e) => debug!("Logout call failed (non-critical): {}", e),
        }
        self.clear_auth();
        info!("Signed out");
    }

    pub fn clear_auth(&self) {
        self.state.send_modify(|s| {
            s.status = AuthStatus::Unauthenticated;
            s.user = None;
            s.device_ids.clear();
            s.locally_linked.clear();
            s.device_id = None;
            s.device_status = DeviceStatus::NotPaired;
        });
    }

    pub fn set_device_id(&self, device_id: Option<String>) {
        self.state.send_if_modified(|s| {
            if s.device_id == device_id {
                return false;
            }
            s.device_id = device_id;
            true
        });
    }

    pub fn set_device_status(&self, status: DeviceStatus) {
        self.state.send_if_modified(|s| {
            if s.device_status == status {
                return false;
            }
            s.device_status = status;
            true
        });
    }

    /// Record a device this client just linked, ahead of the next profile
    pub fn mark_device_linked(&self, device_id: &str) {
        self.state.send_modify(|s| {
            if s.device_source(device_id).is_none() {
                s.locally_linked.push(device_id.to_string());
            }
            s.device_status = DeviceStatus::PairedOnline;
        });
    }

    /// Register a handler on the API client that clears this session when
    /// the backend rejects the refresh token, then calls `on_invalid`
    /// (typically: route back to the sign-in entry point).
    pub fn install_invalidation_handler<F>(self: &Arc<Self>, on_invalid: F)
    where
        F: Fn(SessionInvalidCode) + Send + Sync + 'static,
    {
        let session: Weak<Self> = Arc::downgrade(self);
        self.api.set_session_invalid_handler(Some(Arc::new(move |code| {
            if let Some(session) = session.upgrade() {
                session.clear_auth();
            }
            on_invalid(code);
        })));
    }

    pub fn remove_invalidation_handler(&self) {
        self.api.set_session_invalid_handler(None);
    }

    fn apply_profile(&self, profile: UserProfile) {
        self.state.send_modify(|s| {
            let selection = reconcile_selection(s.device_id.as_deref(), &profile.device_ids);
            s.device_status = if profile.device_ids.is_empty() {
                DeviceStatus::NotPaired
            } else {
                DeviceStatus::PairedOnline
            };
            s.locally_linked
                .retain(|id| !profile.device_ids.iter().any(|d| d == id));
            s.user = Some(AuthUser {
                id: profile.id,
                email: profile.email,
            });
            s.device_ids = profile.device_ids;
            s.device_id = selection;
            s.status = AuthStatus::Authenticated;
        });
    }
}
