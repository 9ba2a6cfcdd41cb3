//! Error taxonomy of the call orchestration core.
//!
//! Per-job failures never escape the job that produced them: the engine turns
//! them into a terminal `Failed` state and a history record. Only the variants
//! a caller can act on (capacity, unknown ids, bad input) are returned from the
//! public operations.

use thiserror::Error;

use crate::core::model::JobId;

/// Result type for call orchestration operations
pub type CallResult<T> = Result<T, CallError>;

#[derive(Debug, Error)]
pub enum CallError {
    /// The hard queue-length bound is reached; retry later
    #[error("Capacity exceeded: {queued} jobs queued (bound {bound})")]
    CapacityExceeded { queued: usize, bound: usize },

    /// The call-control peer refused the originate command
    #[error("Originate rejected: {reason}")]
    OriginateRejected { reason: String, transient: bool },

    /// The callee did not answer before the ring timeout
    #[error("No answer")]
    NoAnswer,

    /// The control session dropped while the call was in progress
    #[error("Connection to call-control peer lost")]
    ConnectionLost,

    /// The TTS engine could not produce audio for the message
    #[error("Speech synthesis failed: {0}")]
    SynthesisFailed(String),

    /// The peer referenced a correlation id we do not track
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// No live session to the call-control peer
    #[error("Not connected to call-control peer")]
    NotConnected,

    /// The peer did not answer a command in time
    #[error("Action timed out: {0}")]
    ActionTimeout(String),

    /// Authentication with the call-control peer failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Unknown ticket: {0}")]
    UnknownTicket(JobId),

    #[error("Unknown contact group: {0}")]
    UnknownGroup(String),

    #[error("Unknown extension: {0}")]
    UnknownExtension(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The home automation event endpoint refused or missed an event
    #[error("Event notification failed: {0}")]
    NotificationFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The engine task is gone; only happens during shutdown
    #[error("Call engine stopped")]
    EngineStopped,
}

impl CallError {
    /// Whether an originate failure is in the retryable transient set
    pub fn is_transient(&self) -> bool {
        match self {
            CallError::OriginateRejected { transient, .. } => *transient,
            CallError::ConnectionLost | CallError::NotConnected => true,
            _ => false,
        }
    }

    /// Short machine-readable code used by the submission surface
    pub fn code(&self) -> &'static str {
        match self {
            CallError::CapacityExceeded { .. } => "capacity_exceeded",
            CallError::OriginateRejected { .. } => "originate_rejected",
            CallError::NoAnswer => "no_answer",
            CallError::ConnectionLost => "connection_lost",
            CallError::SynthesisFailed(_) => "synthesis_failed",
            CallError::ProtocolDesync(_) => "protocol_desync",
            CallError::NotConnected => "not_connected",
            CallError::ActionTimeout(_) => "action_timeout",
            CallError::AuthenticationFailed(_) => "authentication_failed",
            CallError::UnknownTicket(_) => "unknown_ticket",
            CallError::UnknownGroup(_) => "unknown_group",
            CallError::UnknownExtension(_) => "unknown_extension",
            CallError::InvalidRequest(_) => "invalid_request",
            CallError::NotificationFailed(_) => "notification_failed",
            CallError::Io(_) => "io_error",
            CallError::Serialization(_) => "serialization_error",
            CallError::EngineStopped => "engine_stopped",
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Serialization(err.to_string())
    }
}
