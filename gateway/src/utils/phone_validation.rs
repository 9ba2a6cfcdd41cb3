//! Phone number validation for outbound destinations.
//!
//! Numbers are accepted in the loose formats people type (`+1 (555) 010-0100`,
//! `555.0100`) and normalized to an optional leading `+` followed by digits.
//! Internal extensions are short digit strings, so the lower bound is three
//! digits.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Separators stripped before validation
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s\-\.\(\)/]").unwrap());

/// Optional `+`, then 3 to 20 digits
static NORMALIZED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[0-9]{3,20}$").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhoneValidationError {
    #[error("Phone number is empty")]
    Empty,

    #[error("Invalid phone number: {0}")]
    Invalid(String),
}

/// Validate a destination and return its normalized form.
pub fn validate_phone_number(input: &str) -> Result<String, PhoneValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(PhoneValidationError::Empty);
    }

    let normalized = SEPARATORS.replace_all(trimmed, "");
    if !NORMALIZED.is_match(&normalized) {
        return Err(PhoneValidationError::Invalid(trimmed.to_string()));
    }
    Ok(normalized.into_owned())
}
