use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the path of the default configuration file
pub fn default_config_path() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home
        .join(".config")
        .join("studio-proxy")
        .join("config.json"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub browser: BrowserConfig,
    pub timings: Timings,
    pub envelope: EnvelopeConfig,
    pub conversation: ConversationConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub model_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2048,
            model_name: "google-ai-studio-via-browser".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// CDP websocket URL, or the `http://host:port` of the DevTools endpoint.
    pub endpoint: String,
    pub target_url: String,
    /// Substring identifying an already open backend page.
    pub url_pattern: String,
    pub diagnostics_dir: PathBuf,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9222".to_string(),
            target_url: "https://aistudio.google.com/prompts/new_chat".to_string(),
            url_pattern: "aistudio.google.com/".to_string(),
            diagnostics_dir: PathBuf::from("errors"),
        }
    }
}

/// Detection and interaction tuning. All values are milliseconds except
/// `finalize_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub operation_timeout: u64,
    pub poll_interval: u64,
    pub stream_poll_interval: u64,
    pub probe_timeout: u64,
    pub strict_probe_timeout: u64,
    pub settle_delay: u64,
    pub silence_duration: u64,
    pub input_ready_timeout: u64,
    pub fill_timeout: u64,
    pub submit_ready_timeout: u64,
    pub click_timeout: u64,
    pub snapshot_timeout: u64,
    pub finalize_attempts: u32,
    pub finalize_backoff: u64,
    pub clear_chat_timeout: u64,
    pub stream_cooldown: u64,
    pub reconnect_interval: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            operation_timeout: 300_000,
            poll_interval: 300,
            stream_poll_interval: 200,
            probe_timeout: 100,
            strict_probe_timeout: 500,
            settle_delay: 500,
            silence_duration: 3000,
            input_ready_timeout: 10_000,
            fill_timeout: 60_000,
            submit_ready_timeout: 10_000,
            click_timeout: 10_000,
            snapshot_timeout: 1500,
            finalize_attempts: 3,
            finalize_backoff: 1500,
            clear_chat_timeout: 5000,
            stream_cooldown: 1000,
            reconnect_interval: 5000,
        }
    }
}

macro_rules! millis_accessors {
    ($($field:ident),* $(,)?) => {
        impl Timings {
            $(
                pub fn $field(&self) -> Duration {
                    Duration::from_millis(self.$field)
                }
            )*
        }
    };
}

millis_accessors!(
    operation_timeout,
    poll_interval,
    stream_poll_interval,
    probe_timeout,
    strict_probe_timeout,
    settle_delay,
    silence_duration,
    input_ready_timeout,
    fill_timeout,
    submit_ready_timeout,
    click_timeout,
    snapshot_timeout,
    finalize_backoff,
    clear_chat_timeout,
    stream_cooldown,
    reconnect_interval,
);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    pub answer_field: String,
    pub start_marker: String,
    /// Unwrap a second envelope found inside the answer field.
    pub unwrap_nested: bool,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            answer_field: "response".to_string(),
            start_marker: "<<<START_RESPONSE>>>".to_string(),
            unwrap_nested: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub clear_on_new_conversation: bool,
    pub include_history: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            clear_on_new_conversation: true,
            include_history: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub path: Option<PathBuf>,
}

impl ProxyConfig {
    /// Load from `path`, or from the default location when it exists.
    /// A missing default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default_path = default_config_path()?;
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `STUDIO_PROXY_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("STUDIO_PROXY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("STUDIO_PROXY_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid STUDIO_PROXY_PORT: {port}"))?;
        }
        if let Some(endpoint) = lookup("STUDIO_PROXY_ENDPOINT") {
            self.browser.endpoint = endpoint;
        }
        if let Some(target_url) = lookup("STUDIO_PROXY_TARGET_URL") {
            self.browser.target_url = target_url;
        }
        if let Some(path) = lookup("STUDIO_PROXY_RECORDING") {
            self.recording.path = Some(PathBuf::from(path));
        }
        Ok(())
    }
}
