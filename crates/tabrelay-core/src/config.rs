//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Backend id used when a requested model name is not in the registry.
pub const DEFAULT_MODEL_ID: &str = "f44e280a-7914-43ca-a25d-ecfcc5d48d09";

/// Paths to the bridge's data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// JSONC configuration (`data/config.jsonc`).
    pub config_file: PathBuf,
    /// Model name → backend id table (`data/models.json`).
    pub models_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            config_file: root.join("config.jsonc"),
            models_file: root.join("models.json"),
            root,
        })
    }
}

/// Runtime configuration, persisted as `config.jsonc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer key required on client requests when set.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Merge every system message into one leading system message.
    #[serde(default)]
    pub tavern_mode_enabled: bool,
    /// Append a synthetic trailing user turn.
    #[serde(default)]
    pub bypass_enabled: bool,
    /// Append an empty assistant template for the worker to fill.
    #[serde(default = "default_true")]
    pub assistant_placeholder_enabled: bool,
    #[serde(default)]
    pub log_server_requests: bool,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub pickup_timeout_secs: u64,
    #[serde(default = "default_finish_grace_secs")]
    pub finish_grace_secs: u64,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Times a job may move to another worker after its worker died.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    #[serde(default = "default_model_id")]
    pub default_model_id: String,
}

fn default_version() -> String {
    "0.0.0".into()
}
fn default_port() -> u16 {
    5102
}
fn default_true() -> bool {
    true
}
fn default_heartbeat_secs() -> u64 {
    2
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_finish_grace_secs() -> u64 {
    5
}
fn default_outbound_capacity() -> usize {
    32
}
fn default_max_redeliveries() -> u32 {
    3
}
fn default_model_id() -> String {
    DEFAULT_MODEL_ID.into()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            port: default_port(),
            api_key: None,
            tavern_mode_enabled: false,
            bypass_enabled: false,
            assistant_placeholder_enabled: true,
            log_server_requests: false,
            heartbeat_interval_secs: default_heartbeat_secs(),
            stream_timeout_secs: default_timeout_secs(),
            pickup_timeout_secs: default_timeout_secs(),
            finish_grace_secs: default_finish_grace_secs(),
            outbound_capacity: default_outbound_capacity(),
            max_redeliveries: default_max_redeliveries(),
            default_model_id: default_model_id(),
        }
    }
}

impl BridgeConfig {
    /// Load config from a JSONC file, falling back to defaults on any error.
    pub fn load(config_path: &Path) -> Self {
        match Self::try_load(config_path) {
            Ok(config) => {
                info!(
                    tavern_mode = config.tavern_mode_enabled,
                    bypass = config.bypass_enabled,
                    "Loaded config from {}",
                    config_path.display()
                );
                config
            }
            Err(e) => {
                error!(
                    "Failed to load {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Load config from a JSONC file, reporting read and parse failures.
    pub fn try_load(config_path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(config_path)?;
        Self::from_jsonc(&raw)
    }

    /// Parse config from JSONC text.
    pub fn from_jsonc(raw: &str) -> Result<Self> {
        let json = strip_jsonc_comments(raw);
        serde_json::from_str(&json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply environment overrides (`PORT`).
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs.max(1))
    }

    pub fn pickup_timeout(&self) -> Duration {
        Duration::from_secs(self.pickup_timeout_secs.max(1))
    }

    pub fn finish_grace(&self) -> Duration {
        Duration::from_secs(self.finish_grace_secs.max(1))
    }

    /// Config as JSON with the API key masked.
    pub fn to_public_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if self.api_key.is_some() {
            value["api_key"] = serde_json::json!("********");
        }
        value
    }
}

/// Remove `//` and `/* */` comments, leaving string literals intact.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                // Line comment: drop through end of line, keep the newline.
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }

    out
}
