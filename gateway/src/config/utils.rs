use std::env;
use std::str::FromStr;

/// Read an environment variable, treating empty values as unset.
pub(super) fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, with a readable error naming the variable.
pub(super) fn parse_env<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name}: {raw:?} ({e})").into()),
        None => Ok(None),
    }
}

/// Accepts true/false, 1/0, yes/no, on/off.
pub(super) fn parse_bool_env(name: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    match env_var(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(format!("Invalid boolean for {name}: {raw:?}").into()),
        },
        None => Ok(None),
    }
}
