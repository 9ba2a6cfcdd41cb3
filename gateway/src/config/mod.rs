//! Configuration for the outcall gateway
//!
//! Configuration comes from .env files, YAML files and environment variables.
//! Priority: YAML > ENV vars > .env values > defaults. The .env file is loaded
//! in `main` before anything here runs.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML over the environment
//! - `validation`: Configuration validation
//!
//! # Example
//! ```rust,no_run
//! use outcall_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_env()?;
//!
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod utils;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::control::{AmiClientConfig, DialPlan, ReconnectPolicy};
use crate::core::engine::EngineConfig;
use crate::core::model::{ContactGroup, Extension};
use crate::core::notify::{DEFAULT_EVENT_PREFIX, NotifierConfig};
use crate::core::tts::TtsCacheConfig;
use crate::utils::Secret;

/// Manager interface connection settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub host: String,
    /// Default: 5038
    pub port: u16,
    pub username: String,
    pub secret: Secret,
    /// Default: 5000
    pub action_timeout_ms: u64,
    /// Default: 5000
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5038,
            username: "admin".to_string(),
            secret: Secret::default(),
            action_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Dial plan coordinates and the caller id used when a request has none
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialingConfig {
    pub trunk: String,
    pub channel_technology: String,
    pub context: String,
    pub exten: String,
    pub priority: u32,
    pub default_caller_id: String,
}

impl Default for DialingConfig {
    fn default() -> Self {
        Self {
            trunk: "trunk_main".to_string(),
            channel_technology: "SIP".to_string(),
            context: "outbound-playback".to_string(),
            exten: "s".to_string(),
            priority: 1,
            default_caller_id: "Home Assistant".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallsConfig {
    /// Default: 5
    pub concurrency_limit: usize,
    /// Unbounded when `None`
    pub max_queue_length: Option<usize>,
    /// Default: 45
    pub ring_timeout_secs: u64,
    pub retry_no_answer: bool,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            max_queue_length: None,
            ring_timeout_secs: 45,
            retry_no_answer: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub engine: String,
    pub voice: String,
    /// HTTP synthesis endpoint; text messages are refused when unset
    pub endpoint: Option<String>,
    pub token: Option<Secret>,
    pub cache_dir: PathBuf,
    /// Default: 256 MiB
    pub cache_max_bytes: u64,
    /// Default: 30
    pub request_timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            engine: "piper".to_string(),
            voice: "en_US-amy-medium".to_string(),
            endpoint: None,
            token: None,
            cache_dir: PathBuf::from("tts-cache"),
            cache_max_bytes: 256 * 1024 * 1024,
            request_timeout_secs: 30,
        }
    }
}

/// Home automation event API receiving call and broadcast events
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Events are dropped when unset
    pub url: Option<String>,
    pub token: Option<Secret>,
    /// Default: "phone_system_"
    pub prefix: String,
    /// Default: 5
    pub timeout_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            prefix: DEFAULT_EVENT_PREFIX.to_string(),
            timeout_secs: 5,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub manager: ManagerConfig,
    pub dialing: DialingConfig,
    pub calls: CallsConfig,
    pub tts: TtsConfig,
    /// JSON-lines history file; history is in-memory only when unset
    pub history_path: Option<PathBuf>,
    /// JSON-lines journal of finished broadcasts
    pub broadcast_history_path: Option<PathBuf>,
    pub events: EventsConfig,
    pub extensions: Vec<Extension>,
    pub groups: Vec<ContactGroup>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
            manager: ManagerConfig::default(),
            dialing: DialingConfig::default(),
            calls: CallsConfig::default(),
            tts: TtsConfig::default(),
            history_path: None,
            broadcast_history_path: None,
            events: EventsConfig::default(),
            extensions: Vec::new(),
            groups: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if the YAML file cannot be read or is malformed, an
    /// environment variable has an invalid format, or validation fails.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as a string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.calls.ring_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            concurrency_limit: self.calls.concurrency_limit,
            max_queue_length: self.calls.max_queue_length,
            ring_timeout: self.ring_timeout(),
            retry_no_answer: self.calls.retry_no_answer,
        }
    }

    pub fn dial_plan(&self) -> DialPlan {
        DialPlan {
            technology: self.dialing.channel_technology.clone(),
            trunk: self.dialing.trunk.clone(),
            context: self.dialing.context.clone(),
            exten: self.dialing.exten.clone(),
            priority: self.dialing.priority,
        }
    }

    pub fn ami_client_config(&self) -> AmiClientConfig {
        AmiClientConfig {
            host: self.manager.host.clone(),
            port: self.manager.port,
            username: self.manager.username.clone(),
            secret: self.manager.secret.clone(),
            connect_timeout: Duration::from_millis(self.manager.connect_timeout_ms),
            action_timeout: Duration::from_millis(self.manager.action_timeout_ms),
            reconnect: self.manager.reconnect.clone(),
            dial_plan: self.dial_plan(),
        }
    }

    /// `None` when no event endpoint is configured.
    pub fn notifier_config(&self) -> Option<NotifierConfig> {
        let url = self.events.url.clone()?;
        Some(NotifierConfig {
            url,
            token: self.events.token.clone(),
            prefix: self.events.prefix.clone(),
            timeout: Duration::from_secs(self.events.timeout_secs),
        })
    }

    pub fn tts_cache_config(&self) -> TtsCacheConfig {
        TtsCacheConfig {
            dir: self.tts.cache_dir.clone(),
            max_bytes: self.tts.cache_max_bytes,
            default_voice: self.tts.voice.clone(),
            default_engine: self.tts.engine.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "HOST",
        "PORT",
        "AMI_HOST",
        "AMI_PORT",
        "AMI_USERNAME",
        "AMI_SECRET",
        "CONCURRENCY_LIMIT",
        "MAX_QUEUE_LENGTH",
        "RING_TIMEOUT_SECS",
        "RETRY_NO_ANSWER",
        "SIP_TRUNK",
        "DEFAULT_CALLER_ID",
        "TTS_ENGINE",
        "TTS_VOICE",
        "TTS_ENDPOINT",
        "TTS_TOKEN",
        "TTS_CACHE_DIR",
        "TTS_CACHE_MAX_BYTES",
        "HISTORY_PATH",
        "BROADCAST_HISTORY_PATH",
        "EVENTS_URL",
        "EVENTS_TOKEN",
        "EVENTS_PREFIX",
        "SUPERVISOR_TOKEN",
    ];

    fn cleanup_env_vars() {
        unsafe {
            for name in ENV_VARS {
                env::remove_var(name);
            }
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.address(), "0.0.0.0:8088");
        assert_eq!(config.manager.port, 5038);
        assert_eq!(config.calls.concurrency_limit, 5);
        assert_eq!(config.calls.ring_timeout_secs, 45);
        assert_eq!(config.dialing.trunk, "trunk_main");
        assert_eq!(config.dialing.default_caller_id, "Home Assistant");
        assert_eq!(config.tts.cache_max_bytes, 256 * 1024 * 1024);
        assert!(config.history_path.is_none());
        assert!(config.broadcast_history_path.is_none());
        assert!(config.notifier_config().is_none());
    }

    #[test]
    #[serial]
    fn test_supervisor_token_selects_supervisor_api() {
        cleanup_env_vars();
        unsafe {
            env::set_var("SUPERVISOR_TOKEN", "sup-token");
            env::set_var("BROADCAST_HISTORY_PATH", "/data/broadcasts.jsonl");
        }

        let config = ServerConfig::from_env().unwrap();
        let notifier = config.notifier_config().unwrap();
        assert_eq!(notifier.url, "http://supervisor/core/api");
        assert_eq!(notifier.token.as_ref().map(|t| t.expose()), Some("sup-token"));
        assert_eq!(notifier.prefix, "phone_system_");
        assert_eq!(notifier.timeout, Duration::from_secs(5));
        assert_eq!(
            config.broadcast_history_path,
            Some(PathBuf::from("/data/broadcasts.jsonl"))
        );

        unsafe {
            env::set_var("EVENTS_URL", "http://homeassistant:8123/api");
        }
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(
            config.events.url.as_deref(),
            Some("http://homeassistant:8123/api")
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_events_url_must_be_http() {
        cleanup_env_vars();
        unsafe {
            env::set_var("EVENTS_URL", "supervisor/core/api");
        }

        let err = ServerConfig::from_env().unwrap_err().to_string();
        assert!(err.contains("events.url"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_env_overrides_defaults() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "9090");
            env::set_var("AMI_HOST", "pbx.lan");
            env::set_var("AMI_SECRET", "env-secret");
            env::set_var("CONCURRENCY_LIMIT", "2");
            env::set_var("MAX_QUEUE_LENGTH", "10");
            env::set_var("RETRY_NO_ANSWER", "yes");
            env::set_var("TTS_TOKEN", "tok");
        }

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.manager.host, "pbx.lan");
        assert_eq!(config.manager.secret.expose(), "env-secret");
        assert_eq!(config.calls.concurrency_limit, 2);
        assert_eq!(config.calls.max_queue_length, Some(10));
        assert!(config.calls.retry_no_answer);
        assert_eq!(config.tts.token.as_ref().map(|t| t.expose()), Some("tok"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_reported() {
        cleanup_env_vars();
        unsafe {
            env::set_var("CONCURRENCY_LIMIT", "many");
        }

        let err = ServerConfig::from_env().unwrap_err().to_string();
        assert!(err.contains("CONCURRENCY_LIMIT"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_zero_concurrency_is_rejected() {
        cleanup_env_vars();
        unsafe {
            env::set_var("CONCURRENCY_LIMIT", "0");
        }

        let err = ServerConfig::from_env().unwrap_err().to_string();
        assert!(err.contains("concurrency_limit"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let yaml_content = r#"
server:
  host: "127.0.0.1"
manager:
  host: "yaml-pbx"
calls:
  ring_timeout_secs: 20
groups:
  - name: "family"
    numbers: ["+15550100", "+1 555 0101"]
extensions:
  - number: "100"
    secret: "ext-secret"
"#;
        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            env::set_var("HOST", "0.0.0.0");
            env::set_var("AMI_HOST", "env-pbx");
            env::set_var("PORT", "7000");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.manager.host, "yaml-pbx");
        // ENV value survives where YAML is silent
        assert_eq!(config.port, 7000);
        assert_eq!(config.ring_timeout(), Duration::from_secs(20));
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.extensions[0].display_name, "100");

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_duplicate_groups_are_rejected() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let yaml_content = r#"
groups:
  - name: "family"
    numbers: ["+15550100"]
  - name: "family"
    numbers: ["+15550101"]
"#;
        fs::write(&config_path, yaml_content).unwrap();

        let err = ServerConfig::from_file(&config_path).unwrap_err().to_string();
        assert!(err.contains("duplicate group name"));
    }

    #[test]
    #[serial]
    fn test_invalid_group_number_is_rejected() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            "groups:\n  - name: \"family\"\n    numbers: [\"call-me\"]\n",
        )
        .unwrap();

        let err = ServerConfig::from_file(&config_path).unwrap_err().to_string();
        assert!(err.contains("family"));
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let result = ServerConfig::from_file(&PathBuf::from("/nonexistent/config.yaml"));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_derived_runtime_configs() {
        let mut config = ServerConfig::default();
        config.manager.secret = Secret::new("pbx-pass");

        let engine = config.engine_config();
        assert_eq!(engine.concurrency_limit, 5);
        assert_eq!(engine.ring_timeout, Duration::from_secs(45));

        let plan = config.dial_plan();
        assert_eq!(plan.technology, "SIP");
        assert_eq!(plan.context, "outbound-playback");

        let ami = config.ami_client_config();
        assert_eq!(ami.action_timeout, Duration::from_secs(5));
        assert_eq!(ami.secret.expose(), "pbx-pass");
        assert!(!format!("{ami:?}").contains("pbx-pass"));
    }
}
