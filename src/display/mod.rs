//! What a linked display shows: layout preset plus the lines/stops it
//! tracks, stored on the backend per device.

use crate::api::{ApiClient, ApiError, ApiRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MIN_DISPLAY_TYPE: u8 = 1;
pub const MAX_DISPLAY_TYPE: u8 = 5;

pub const SUBWAY_PROVIDER: &str = "mta-subway";
pub const BUS_PROVIDER: &str = "mta-bus";
pub const EMPTY_SELECTION_MESSAGE: &str = "Pick at least one train and stop";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSelection {
    pub provider: String,
    pub line: String,
    pub stop: String,
    /// `N`/`S` for subway rows; bus stops carry no direction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

impl LineSelection {
    /// Subway selection; direction follows the stop id's `N`/`S` suffix
    pub fn subway(provider: &str, line: &str, stop: &str) -> Self {
        let stop = stop.trim().to_uppercase();
        let direction = if stop.ends_with('S') { "S" } else { "N" };
        Self {
            provider: provider.to_string(),
            line: line.trim().to_uppercase(),
            direction: Some(direction.to_string()),
            stop,
        }
    }

    pub fn bus(line: &str, stop: &str) -> Self {
        Self {
            provider: BUS_PROVIDER.to_string(),
            line: line.trim().to_uppercase(),
            stop: stop.trim().to_uppercase(),
            direction: None,
        }
    }

    /// Bus rows for [`BUS_PROVIDER`], subway rows for everything else
    pub fn for_provider(provider: &str, line: &str, stop: &str) -> Self {
        if provider.trim().eq_ignore_ascii_case(BUS_PROVIDER) {
            Self::bus(line, stop)
        } else {
            Self::subway(provider, line, stop)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayConfig {
    pub display_type: u8,
    pub lines: Vec<LineSelection>,
}

#[derive(Debug, Error)]
pub enum DisplayConfigError {
    #[error("{0}")]
    Rejected(String),
    #[error("Network error")]
    Network(#[from] ApiError),
}

/// Trim and upper-case a stop id, appending `direction` (`N`/`S`) when the
/// id doesn't already end in one
pub fn normalize_stop_id(raw_stop: &str, raw_direction: &str) -> String {
    let normalized = raw_stop.trim().to_uppercase();
    if normalized.is_empty() {
        return normalized;
    }
    if normalized.ends_with('N') || normalized.ends_with('S') {
        return normalized;
    }
    match raw_direction.trim().to_uppercase().as_str() {
        dir @ ("N" | "S") => format!("{}{}", normalized, dir),
        _ => normalized,
    }
}

fn clamp_display_type(raw: f64) -> u8 {
    raw.trunc()
        .clamp(MIN_DISPLAY_TYPE as f64, MAX_DISPLAY_TYPE as f64) as u8
}

fn str_field<'a>(row: &'a Value, key: &str) -> &'a str {
    row.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Lenient parse of a `{"config": {...}}` payload. Rows without a line
/// code are dropped; a missing or non-numeric display type falls back to
/// the minimum preset.
pub fn parse_config(body: &Value) -> Option<DisplayConfig> {
    let config = body.get("config")?;
    let display_type = config
        .get("displayType")
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .filter(|v| v.is_finite())
        .map(clamp_display_type)
        .unwrap_or(MIN_DISPLAY_TYPE);

    let lines = config
        .get("lines")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let line = str_field(row, "line").to_uppercase();
                    if line.is_empty() {
                        return None;
                    }
                    let direction = str_field(row, "direction");
                    let normalized_direction = direction.trim().to_uppercase();
                    Some(LineSelection {
                        provider: str_field(row, "provider").to_lowercase(),
                        line,
                        stop: normalize_stop_id(str_field(row, "stop"), direction),
                        direction: (!normalized_direction.is_empty()).then_some(normalized_direction),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(DisplayConfig {
        display_type,
        lines,
    })
}

fn config_path(device_id: &str) -> String {
    format!("/device/{}/config", device_id)
}

fn refresh_path(device_id: &str) -> String {
    format!("/refresh/device/{}", device_id)
}

/// Fetch the stored config; `None` on any failure
pub async fn load(api: &ApiClient, device_id: &str) -> Option<DisplayConfig> {
    match api.get(&config_path(device_id)).await {
        Ok(resp) if resp.is_success() => resp.json::<Value>().as_ref().and_then(parse_config),
        Ok(resp) => {
            debug!("Config for {} unavailable ({})", device_id, resp.status);
            None
        }
        Err(e) => {
            debug!("Config fetch for {} failed: {}", device_id, e);
            None
        }
    }
}

/// Store `config` and ask the backend to push it to the display.
/// A config without lines is refused before any request.
pub async fn save(
    api: &ApiClient,
    device_id: &str,
    config: &DisplayConfig,
) -> Result<(), DisplayConfigError> {
    if config.lines.is_empty() {
        return Err(DisplayConfigError::Rejected(EMPTY_SELECTION_MESSAGE.to_string()));
    }

    let config = DisplayConfig {
        display_type: config.display_type.clamp(MIN_DISPLAY_TYPE, MAX_DISPLAY_TYPE),
        lines: config.lines.clone(),
    };

    let resp = api.post_json(&config_path(device_id), &config).await?;
    if !resp.is_success() {
        let message = resp
            .error_code()
            .unwrap_or_else(|| format!("Failed to save line ({})", resp.status.as_u16()));
        return Err(DisplayConfigError::Rejected(message));
    }
    info!("Saved display config for {}", device_id);

    // Push is best effort; the display also picks the config up on its own
    match api.fetch(&refresh_path(device_id), ApiRequest::post()).await {
        Ok(resp) if !resp.is_success() => warn!("Display refresh returned {}", resp.status),
        Ok(_) => {}
        Err(e) => warn!("Display refresh failed: {}", e),
    }
    Ok(())
}
