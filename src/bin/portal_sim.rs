//! Captive Portal Simulator
//!
//! Serves the display's setup API so the onboarding flow can be exercised
//! without hardware. Point `[device] portal_url` at it.
//!
//! Endpoints (same as the firmware):
//!   GET  /status       → {"deviceId": "...", "wifiConnected": bool}
//!   POST /connect      → form ssid/password/user, {"error": "..."} on failure
//!   GET  /device-info  → {"deviceId": "..."}
//!
//! Usage:
//!   cargo run --bin portal-sim
//!
//! Options (env vars or defaults):
//!   PORTAL_BIND=127.0.0.1:8080   Listen address
//!   DEVICE_ID=CL-SIM-0001        Reported device id
//!   WIFI_PASSWORD=               Accepted password (empty accepts any)
//!   KNOWN_SSIDS=                 Comma-separated visible networks (empty = any)
//!   NO_NETWORKS=0                Set to 1 to report no eligible networks

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

struct SimState {
    device_id: String,
    password: String,
    known_ssids: Vec<String>,
    no_networks: bool,
    /// SSID the simulated display joined, if any
    joined: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct ConnectForm {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    user: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bind: SocketAddr = env::var("PORTAL_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let state = Arc::new(SimState {
        device_id: env::var("DEVICE_ID").unwrap_or_else(|_| "CL-SIM-0001".to_string()),
        password: env::var("WIFI_PASSWORD").unwrap_or_default(),
        known_ssids: env::var("KNOWN_SSIDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        no_networks: env::var("NO_NETWORKS").map(|v| v == "1").unwrap_or(false),
        joined: Mutex::new(None),
    });

    println!("📟 Commute Live Captive Portal Simulator");
    println!("══════════════════════════════════════════");
    println!("  Listening: http://{}", bind);
    println!("  Device id: {}", state.device_id);
    if state.known_ssids.is_empty() {
        println!("  Networks:  any SSID accepted");
    } else {
        println!("  Networks:  {}", state.known_ssids.join(", "));
    }
    println!("══════════════════════════════════════════");
    println!();

    let app = Router::new()
        .route("/status", get(status))
        .route("/connect", post(connect))
        .route("/device-info", get(device_info))
        .with_state(state);

    let listener = TcpListener::bind(bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\n👋 Portal simulator shutting down.");
        })
        .await?;
    Ok(())
}

async fn status(State(state): State<Arc<SimState>>) -> Json<Value> {
    let joined = state.joined.lock().await;
    Json(json!({
        "deviceId": state.device_id,
        "wifiConnected": joined.is_some(),
    }))
}

async fn device_info(State(state): State<Arc<SimState>>) -> Json<Value> {
    Json(json!({ "deviceId": state.device_id }))
}

async fn connect(
    State(state): State<Arc<SimState>>,
    Form(form): Form<ConnectForm>,
) -> (StatusCode, Json<Value>) {
    println!(
        "📥 /connect ssid={:?} user={:?} ({} char password)",
        form.ssid,
        form.user,
        form.password.chars().count()
    );

    let failure = if form.ssid.is_empty() {
        Some((StatusCode::BAD_REQUEST, "Missing SSID"))
    } else if state.no_networks {
        Some((StatusCode::OK, "No Eligible WiFi networks found"))
    } else if !state.known_ssids.is_empty() && !state.known_ssids.contains(&form.ssid) {
        Some((StatusCode::OK, "Target WiFi network not found"))
    } else if !state.password.is_empty() && form.password != state.password {
        Some((StatusCode::OK, "Failed to connect to WiFi bc of credentials"))
    } else {
        None
    };

    if let Some((code, error)) = failure {
        println!("❌ rejecting: {}", error);
        return (code, Json(json!({ "error": error })));
    }

    *state.joined.lock().await = Some(form.ssid.clone());
    println!("✅ joined {:?}", form.ssid);
    (
        StatusCode::OK,
        Json(json!({ "status": "connected", "ssid": form.ssid })),
    )
}
