use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Where the analyzer backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Transport-level timeout; the sync core itself never times out.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Reports are large, so rapid selection changes are collapsed.
    #[serde(default = "default_report_debounce_ms")]
    pub report_debounce_ms: u64,
    /// 0 disables debouncing.
    #[serde(default)]
    pub summary_debounce_ms: u64,
    /// Placeholder content written when a summary fails to load.
    #[serde(default = "default_summary_error_message")]
    pub summary_error_message: String,
    /// When set, report failures also write a placeholder.  Unset by default:
    /// a failed report keeps whatever was shown before and is only logged.
    #[serde(default)]
    pub report_failure_placeholder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_auto_polling")]
    pub auto_polling: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub autoplay: bool,
    #[serde(default = "default_true")]
    pub allow_fullscreen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Explicit mpv binary.  When unset the binary is looked up at runtime.
    #[serde(default)]
    pub mpv_path: Option<PathBuf>,
    #[serde(default = "default_max_buffer_secs")]
    pub max_buffer_secs: u32,
    #[serde(default = "default_max_max_buffer_secs")]
    pub max_max_buffer_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            report_debounce_ms: default_report_debounce_ms(),
            summary_debounce_ms: 0,
            summary_error_message: default_summary_error_message(),
            report_failure_placeholder: None,
        }
    }
}

impl CacheConfig {
    pub fn report_debounce(&self) -> Option<Duration> {
        non_zero_ms(self.report_debounce_ms)
    }

    pub fn summary_debounce(&self) -> Option<Duration> {
        non_zero_ms(self.summary_debounce_ms)
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            auto_polling: default_auto_polling(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            autoplay: true,
            allow_fullscreen: true,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mpv_path: None,
            max_buffer_secs: default_max_buffer_secs(),
            max_max_buffer_secs: default_max_max_buffer_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_report_debounce_ms() -> u64 {
    200
}

fn default_summary_error_message() -> String {
    "Failed to load summary.".to_string()
}

fn default_auto_polling() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_buffer_secs() -> u32 {
    6
}

fn default_max_max_buffer_secs() -> u32 {
    12
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
