use std::path::PathBuf;

use super::utils::{env_var, parse_bool_env, parse_env};
use super::{CallsConfig, DialingConfig, EventsConfig, ManagerConfig, ServerConfig, TtsConfig};
use crate::utils::Secret;

/// Build the configuration from defaults overridden by environment variables.
pub(super) fn load_env() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = ServerConfig::default();

    if let Some(host) = env_var("HOST") {
        config.host = host;
    }
    if let Some(port) = parse_env("PORT")? {
        config.port = port;
    }

    load_manager(&mut config.manager)?;
    load_dialing(&mut config.dialing)?;
    load_calls(&mut config.calls)?;
    load_tts(&mut config.tts)?;

    if let Some(path) = env_var("HISTORY_PATH") {
        config.history_path = Some(PathBuf::from(path));
    }
    if let Some(path) = env_var("BROADCAST_HISTORY_PATH") {
        config.broadcast_history_path = Some(PathBuf::from(path));
    }
    load_events(&mut config.events)?;

    Ok(config)
}

/// Supervisor API used when running as a Home Assistant add-on
const SUPERVISOR_API_URL: &str = "http://supervisor/core/api";

fn load_events(events: &mut EventsConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(token) = env_var("SUPERVISOR_TOKEN") {
        events.url = Some(SUPERVISOR_API_URL.to_string());
        events.token = Some(Secret::from(token));
    }
    if let Some(url) = env_var("EVENTS_URL") {
        events.url = Some(url);
    }
    if let Some(token) = env_var("EVENTS_TOKEN") {
        events.token = Some(Secret::from(token));
    }
    if let Some(prefix) = env_var("EVENTS_PREFIX") {
        events.prefix = prefix;
    }
    Ok(())
}

fn load_manager(manager: &mut ManagerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(host) = env_var("AMI_HOST") {
        manager.host = host;
    }
    if let Some(port) = parse_env("AMI_PORT")? {
        manager.port = port;
    }
    if let Some(username) = env_var("AMI_USERNAME") {
        manager.username = username;
    }
    if let Some(secret) = env_var("AMI_SECRET") {
        manager.secret = Secret::from(secret);
    }
    Ok(())
}

fn load_dialing(dialing: &mut DialingConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(trunk) = env_var("SIP_TRUNK") {
        dialing.trunk = trunk;
    }
    if let Some(caller_id) = env_var("DEFAULT_CALLER_ID") {
        dialing.default_caller_id = caller_id;
    }
    Ok(())
}

fn load_calls(calls: &mut CallsConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(limit) = parse_env("CONCURRENCY_LIMIT")? {
        calls.concurrency_limit = limit;
    }
    if let Some(bound) = parse_env("MAX_QUEUE_LENGTH")? {
        calls.max_queue_length = Some(bound);
    }
    if let Some(secs) = parse_env("RING_TIMEOUT_SECS")? {
        calls.ring_timeout_secs = secs;
    }
    if let Some(retry) = parse_bool_env("RETRY_NO_ANSWER")? {
        calls.retry_no_answer = retry;
    }
    Ok(())
}

fn load_tts(tts: &mut TtsConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(engine) = env_var("TTS_ENGINE") {
        tts.engine = engine;
    }
    if let Some(voice) = env_var("TTS_VOICE") {
        tts.voice = voice;
    }
    if let Some(endpoint) = env_var("TTS_ENDPOINT") {
        tts.endpoint = Some(endpoint);
    }
    if let Some(token) = env_var("TTS_TOKEN") {
        tts.token = Some(Secret::from(token));
    }
    if let Some(dir) = env_var("TTS_CACHE_DIR") {
        tts.cache_dir = PathBuf::from(dir);
    }
    if let Some(bytes) = parse_env("TTS_CACHE_MAX_BYTES")? {
        tts.cache_max_bytes = bytes;
    }
    Ok(())
}
