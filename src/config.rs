use serde::Deserialize;
use std::path::Path;

/// Production backend used when neither the config file nor the
/// environment names one.
pub const DEFAULT_API_BASE: &str = "https://api.commutelive.com";

/// Fixed address of the display's captive portal while it runs its own
/// setup access point.
pub const DEFAULT_PORTAL_URL: &str = "http://192.168.4.1";

/// Environment variables consulted (in order) for the backend base URL.
pub const SERVER_URL_ENV_VARS: [&str; 2] = ["COMMUTE_LIVE_SERVER_URL", "SERVER_URL"];

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_api_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub portal_url: String,
    #[serde(default = "default_portal_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_status_poll")]
    pub status_poll_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_api_timeout() -> u64 {
    30
}

fn default_portal_timeout() -> u64 {
    10
}

fn default_status_poll() -> u64 {
    5
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    /// Apply the server URL environment override, first match wins.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = SERVER_URL_ENV_VARS
            .iter()
            .find_map(|key| lookup(key).filter(|v| !v.trim().is_empty()))
        {
            self.api.base_url = url;
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            device: DeviceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            request_timeout_secs: default_api_timeout(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            portal_url: DEFAULT_PORTAL_URL.to_string(),
            request_timeout_secs: default_portal_timeout(),
            status_poll_secs: default_status_poll(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
