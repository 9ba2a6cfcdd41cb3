use std::path::PathBuf;

use super::env::load_env;
use super::yaml::{ReconnectYaml, YamlConfig};
use super::ServerConfig;
use crate::core::control::ReconnectPolicy;
use crate::core::model::{ContactGroup, Extension};

/// Environment (with defaults) as the base, YAML values on top.
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = load_env()?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
    }

    if let Some(manager) = yaml.manager {
        let target = &mut config.manager;
        if let Some(host) = manager.host {
            target.host = host;
        }
        if let Some(port) = manager.port {
            target.port = port;
        }
        if let Some(username) = manager.username {
            target.username = username;
        }
        if let Some(secret) = manager.secret {
            target.secret = secret;
        }
        if let Some(ms) = manager.action_timeout_ms {
            target.action_timeout_ms = ms;
        }
        if let Some(ms) = manager.connect_timeout_ms {
            target.connect_timeout_ms = ms;
        }
        if let Some(reconnect) = manager.reconnect {
            merge_reconnect(&mut target.reconnect, reconnect);
        }
    }

    if let Some(dialing) = yaml.dialing {
        let target = &mut config.dialing;
        if let Some(trunk) = dialing.trunk {
            target.trunk = trunk;
        }
        if let Some(technology) = dialing.channel_technology {
            target.channel_technology = technology;
        }
        if let Some(context) = dialing.context {
            target.context = context;
        }
        if let Some(exten) = dialing.exten {
            target.exten = exten;
        }
        if let Some(priority) = dialing.priority {
            target.priority = priority;
        }
        if let Some(caller_id) = dialing.default_caller_id {
            target.default_caller_id = caller_id;
        }
    }

    if let Some(calls) = yaml.calls {
        let target = &mut config.calls;
        if let Some(limit) = calls.concurrency_limit {
            target.concurrency_limit = limit;
        }
        if let Some(bound) = calls.max_queue_length {
            target.max_queue_length = Some(bound);
        }
        if let Some(secs) = calls.ring_timeout_secs {
            target.ring_timeout_secs = secs;
        }
        if let Some(retry) = calls.retry_no_answer {
            target.retry_no_answer = retry;
        }
    }

    if let Some(tts) = yaml.tts {
        let target = &mut config.tts;
        if let Some(engine) = tts.engine {
            target.engine = engine;
        }
        if let Some(voice) = tts.voice {
            target.voice = voice;
        }
        if let Some(endpoint) = tts.endpoint {
            target.endpoint = Some(endpoint);
        }
        if let Some(token) = tts.token {
            target.token = Some(token);
        }
        if let Some(dir) = tts.cache_dir {
            target.cache_dir = PathBuf::from(dir);
        }
        if let Some(bytes) = tts.cache_max_bytes {
            target.cache_max_bytes = bytes;
        }
        if let Some(secs) = tts.request_timeout_secs {
            target.request_timeout_secs = secs;
        }
    }

    if let Some(history) = yaml.history {
        if let Some(path) = history.path {
            config.history_path = Some(PathBuf::from(path));
        }
        if let Some(path) = history.broadcasts_path {
            config.broadcast_history_path = Some(PathBuf::from(path));
        }
    }

    if let Some(events) = yaml.events {
        let target = &mut config.events;
        if let Some(url) = events.url {
            target.url = Some(url);
        }
        if let Some(token) = events.token {
            target.token = Some(token);
        }
        if let Some(prefix) = events.prefix {
            target.prefix = prefix;
        }
        if let Some(secs) = events.timeout_secs {
            target.timeout_secs = secs;
        }
    }

    if let Some(extensions) = yaml.extensions {
        config.extensions = extensions
            .into_iter()
            .map(|ext| Extension {
                display_name: ext.display_name.unwrap_or_else(|| ext.number.clone()),
                secret: ext
                    .secret
                    .map(|s| s.expose().to_string())
                    .unwrap_or_default(),
                number: ext.number,
            })
            .collect();
    }

    if let Some(groups) = yaml.groups {
        config.groups = groups
            .into_iter()
            .map(|group| ContactGroup {
                name: group.name,
                numbers: group.numbers,
                caller_id: group.caller_id,
            })
            .collect();
    }

    Ok(config)
}

fn merge_reconnect(target: &mut ReconnectPolicy, yaml: ReconnectYaml) {
    if let Some(ms) = yaml.initial_delay_ms {
        target.initial_delay_ms = ms;
    }
    if let Some(ms) = yaml.max_delay_ms {
        target.max_delay_ms = ms;
    }
    if let Some(multiplier) = yaml.backoff_multiplier {
        target.backoff_multiplier = multiplier;
    }
    if let Some(jitter) = yaml.jitter {
        target.jitter = jitter;
    }
    if let Some(attempts) = yaml.alarm_after_attempts {
        target.alarm_after_attempts = attempts;
    }
}
