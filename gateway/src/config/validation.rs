use std::collections::HashSet;

use super::ServerConfig;
use crate::utils::validate_phone_number;

/// Check the merged configuration before anything is started.
pub(super) fn validate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_calls(config)?;
    validate_extensions(config)?;
    validate_groups(config)?;
    validate_tts(config)?;
    validate_events(config)?;
    Ok(())
}

fn validate_calls(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.calls.concurrency_limit == 0 {
        return Err("calls.concurrency_limit must be at least 1".into());
    }
    if config.calls.ring_timeout_secs == 0 {
        return Err("calls.ring_timeout_secs must be at least 1".into());
    }
    if config.calls.max_queue_length == Some(0) {
        return Err("calls.max_queue_length must be at least 1 when set".into());
    }
    Ok(())
}

fn validate_extensions(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut seen = HashSet::new();
    for extension in &config.extensions {
        if extension.number.trim().is_empty() {
            return Err("extension number must not be empty".into());
        }
        if !seen.insert(extension.number.as_str()) {
            return Err(format!("duplicate extension number: {}", extension.number).into());
        }
    }
    Ok(())
}

fn validate_groups(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut seen = HashSet::new();
    for group in &config.groups {
        if group.name.trim().is_empty() {
            return Err("group name must not be empty".into());
        }
        if !seen.insert(group.name.as_str()) {
            return Err(format!("duplicate group name: {}", group.name).into());
        }
        for number in &group.numbers {
            validate_phone_number(number)
                .map_err(|e| format!("group {}: {e}", group.name))?;
        }
    }
    Ok(())
}

fn validate_events(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(url) = &config.events.url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("events.url must be an http(s) URL, got {url}").into());
        }
    }
    if config.events.timeout_secs == 0 {
        return Err("events.timeout_secs must be greater than 0".into());
    }
    Ok(())
}

fn validate_tts(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.tts.cache_max_bytes == 0 {
        return Err("tts.cache_max_bytes must be greater than 0".into());
    }
    Ok(())
}
