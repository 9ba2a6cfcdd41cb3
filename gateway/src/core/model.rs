//! Data model shared by the call engine, the broadcast dispatcher and the
//! history recorder.
//!
//! A [`CallJob`] is immutable once created. Identity types are thin newtypes
//! over [`Uuid`] so that a job id can never be confused with a correlation id
//! or a broadcast id at a call site.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_newtype!(
    /// Unique identifier of a call job. Also serves as the admission ticket.
    JobId
);

id_newtype!(
    /// Identifier tying an originate command to its event stream on the peer.
    CorrelationId
);

id_newtype!(
    /// Identifier of a broadcast request.
    BroadcastId
);

/// Admission ticket returned by `submit`. Cancelling by ticket follows the
/// retry chain, so a ticket stays valid after an automatic retry.
pub type Ticket = JobId;

/// What the callee hears once the call is answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageSpec {
    /// Literal text, synthesized through the TTS cache before origination.
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engine: Option<String>,
    },
    /// A recording already present in the peer's sound directory.
    Recording { file: String },
}

impl MessageSpec {
    pub fn text(text: impl Into<String>) -> Self {
        MessageSpec::Text {
            text: text.into(),
            voice: None,
            engine: None,
        }
    }

    pub fn recording(file: impl Into<String>) -> Self {
        MessageSpec::Recording { file: file.into() }
    }
}

/// Which attempt of a logical call a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attempt {
    #[default]
    Original,
    Retry { original_job_id: JobId },
}

impl Attempt {
    pub fn is_retry(&self) -> bool {
        matches!(self, Attempt::Retry { .. })
    }
}

/// Lower value is more urgent. Admission is FIFO; priority is carried for
/// reporting and for the dial plan.
pub type Priority = u8;

pub const DEFAULT_PRIORITY: Priority = 5;

/// A single outbound call to one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallJob {
    pub job_id: JobId,
    pub destination: String,
    pub caller_id: String,
    pub message: MessageSpec,
    /// Originating extension number, when a specific line was requested
    pub extension: Option<String>,
    pub created_at: DateTime<Utc>,
    pub priority: Priority,
    /// Automatic retries allowed for transient failures (0 or 1)
    pub max_retries: u8,
    pub broadcast_id: Option<BroadcastId>,
    pub attempt: Attempt,
}

impl CallJob {
    pub fn new(
        destination: impl Into<String>,
        caller_id: impl Into<String>,
        message: MessageSpec,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            destination: destination.into(),
            caller_id: caller_id.into(),
            message,
            extension: None,
            created_at: Utc::now(),
            priority: DEFAULT_PRIORITY,
            max_retries: 1,
            broadcast_id: None,
            attempt: Attempt::Original,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Retries are capped at one to avoid call storms.
    pub fn with_max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = max_retries.min(1);
        self
    }

    pub fn with_broadcast(mut self, broadcast_id: BroadcastId) -> Self {
        self.broadcast_id = Some(broadcast_id);
        self
    }

    /// Build the follow-up attempt for this job: fresh identity, same
    /// destination and content, no further retries.
    pub fn retry(&self) -> Self {
        Self {
            job_id: JobId::new(),
            created_at: Utc::now(),
            max_retries: 0,
            attempt: Attempt::Retry {
                original_job_id: self.root_job_id(),
            },
            ..self.clone()
        }
    }

    /// The job id of the first attempt of this logical call.
    pub fn root_job_id(&self) -> JobId {
        match self.attempt {
            Attempt::Original => self.job_id,
            Attempt::Retry { original_job_id } => original_job_id,
        }
    }

    pub fn can_retry(&self) -> bool {
        !self.attempt.is_retry() && self.max_retries > 0
    }
}

/// An originating line. Authentication of the extension is handled by the
/// call-control peer; the secret is only kept to hand it over.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Extension {
    pub number: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub display_name: String,
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("number", &self.number)
            .field("secret", &"<redacted>")
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Named list of destinations. Duplicates are kept: each entry is its own job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactGroup {
    pub name: String,
    pub numbers: Vec<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_keeps_root_and_disables_further_retries() {
        let job = CallJob::new("+15550100", "Home", MessageSpec::text("hi"));
        let retry = job.retry();

        assert_ne!(retry.job_id, job.job_id);
        assert_eq!(retry.root_job_id(), job.job_id);
        assert_eq!(
            retry.attempt,
            Attempt::Retry {
                original_job_id: job.job_id
            }
        );
        assert!(job.can_retry());
        assert!(!retry.can_retry());
        assert_eq!(retry.destination, job.destination);
    }

    #[test]
    fn test_max_retries_is_capped() {
        let job = CallJob::new("+15550100", "Home", MessageSpec::text("hi")).with_max_retries(3);
        assert_eq!(job.max_retries, 1);
    }

    #[test]
    fn test_message_spec_serde_shape() {
        let spec = MessageSpec::recording("custom/doorbell");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "recording");
        assert_eq!(json["file"], "custom/doorbell");

        let parsed: MessageSpec =
            serde_json::from_str(r#"{"type":"text","text":"hello"}"#).unwrap();
        assert_eq!(parsed, MessageSpec::text("hello"));
    }

    #[test]
    fn test_extension_debug_redacts_secret() {
        let ext = Extension {
            number: "100".to_string(),
            secret: "hunter2".to_string(),
            display_name: "Kitchen".to_string(),
        };
        let debug = format!("{:?}", ext);
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_id_roundtrip_through_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
