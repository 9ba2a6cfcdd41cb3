//! HTTP request handlers
//!
//! - `api` - Health, engine stats, call history and contact groups
//! - `calls` - Single-call submission, status and cancellation
//! - `broadcasts` - Broadcast submission and progress

pub mod api;
pub mod broadcasts;
pub mod calls;

use serde::Deserialize;

use crate::core::model::MessageSpec;
use crate::errors::{AppError, AppResult};

/// Message fields shared by call and broadcast requests. `message` and
/// `tts_text` are synonyms; a recording takes precedence over text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageFields {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub tts_text: Option<String>,
    #[serde(default)]
    pub recording_file: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
}

impl MessageFields {
    pub fn into_spec(self) -> AppResult<MessageSpec> {
        if let Some(file) = self.recording_file.filter(|f| !f.trim().is_empty()) {
            return Ok(MessageSpec::Recording { file });
        }
        let text = self
            .message
            .or(self.tts_text)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                AppError::BadRequest(
                    "one of message, tts_text or recording_file is required".to_string(),
                )
            })?;
        Ok(MessageSpec::Text {
            text,
            voice: self.voice,
            engine: self.engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_takes_precedence() {
        let fields = MessageFields {
            message: Some("hello".into()),
            recording_file: Some("custom/doorbell".into()),
            ..Default::default()
        };
        assert_eq!(
            fields.into_spec().unwrap(),
            MessageSpec::recording("custom/doorbell")
        );
    }

    #[test]
    fn test_tts_text_alias() {
        let fields = MessageFields {
            tts_text: Some("dinner is ready".into()),
            voice: Some("amy".into()),
            ..Default::default()
        };
        assert_eq!(
            fields.into_spec().unwrap(),
            MessageSpec::Text {
                text: "dinner is ready".into(),
                voice: Some("amy".into()),
                engine: None,
            }
        );
    }

    #[test]
    fn test_missing_message_is_rejected() {
        let fields = MessageFields {
            message: Some("   ".into()),
            ..Default::default()
        };
        assert!(matches!(fields.into_spec(), Err(AppError::BadRequest(_))));
    }
}
