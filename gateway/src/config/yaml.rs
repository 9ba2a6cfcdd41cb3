use serde::Deserialize;
use std::path::PathBuf;

use crate::utils::Secret;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8088
///
/// manager:
///   host: "127.0.0.1"
///   port: 5038
///   username: "outcall"
///   secret: "manager-secret"
///   action_timeout_ms: 5000
///   reconnect:
///     initial_delay_ms: 1000
///     max_delay_ms: 30000
///     alarm_after_attempts: 5
///
/// dialing:
///   trunk: "trunk_main"
///   channel_technology: "SIP"
///   context: "outbound-playback"
///   default_caller_id: "Home Assistant"
///
/// calls:
///   concurrency_limit: 5
///   max_queue_length: 200
///   ring_timeout_secs: 45
///
/// tts:
///   engine: "piper"
///   voice: "en_US-amy-medium"
///   endpoint: "http://localhost:10200/synthesize"
///   cache_dir: "/var/cache/outcall/tts"
///   cache_max_bytes: 268435456
///
/// history:
///   path: "/var/lib/outcall/history.jsonl"
///   broadcasts_path: "/var/lib/outcall/broadcasts.jsonl"
///
/// events:
///   url: "http://homeassistant:8123/api"
///   token: "long-lived-token"
///   prefix: "phone_system_"
///   timeout_secs: 5
///
/// extensions:
///   - number: "100"
///     secret: "ext-secret"
///     display_name: "Kitchen"
///
/// groups:
///   - name: "family"
///     numbers: ["+15550100", "+15550101"]
///     caller_id: "Home"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub manager: Option<ManagerYaml>,
    pub dialing: Option<DialingYaml>,
    pub calls: Option<CallsYaml>,
    pub tts: Option<TtsYaml>,
    pub history: Option<HistoryYaml>,
    pub events: Option<EventsYaml>,
    pub extensions: Option<Vec<ExtensionYaml>>,
    pub groups: Option<Vec<GroupYaml>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Manager interface (call-control peer) connection
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ManagerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub secret: Option<Secret>,
    pub action_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub reconnect: Option<ReconnectYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectYaml {
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f32>,
    pub jitter: Option<bool>,
    pub alarm_after_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DialingYaml {
    pub trunk: Option<String>,
    pub channel_technology: Option<String>,
    pub context: Option<String>,
    pub exten: Option<String>,
    pub priority: Option<u32>,
    pub default_caller_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CallsYaml {
    pub concurrency_limit: Option<usize>,
    pub max_queue_length: Option<usize>,
    pub ring_timeout_secs: Option<u64>,
    pub retry_no_answer: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TtsYaml {
    pub engine: Option<String>,
    pub voice: Option<String>,
    pub endpoint: Option<String>,
    pub token: Option<Secret>,
    pub cache_dir: Option<String>,
    pub cache_max_bytes: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HistoryYaml {
    pub path: Option<String>,
    pub broadcasts_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EventsYaml {
    pub url: Option<String>,
    pub token: Option<Secret>,
    pub prefix: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionYaml {
    pub number: String,
    #[serde(default)]
    pub secret: Option<Secret>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupYaml {
    pub name: String,
    #[serde(alias = "phone_numbers")]
    pub numbers: Vec<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
