//! Call-control boundary.
//!
//! The orchestration core talks to the external call-control peer (an Asterisk
//! manager interface) through the [`CallControl`] trait: commands go out as
//! async method calls, state notifications come back as [`PeerEvent`]s on a
//! channel handed to the client at construction. The engine owns the receiving
//! end, so no I/O task ever mutates job state directly.

mod backoff;
pub mod client;
pub mod protocol;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::core::model::{CorrelationId, JobId};
use crate::errors::CallResult;

pub use backoff::ReconnectPolicy;
pub use client::{AmiClient, AmiClientConfig, DialPlan};

/// Why the peer reported an originate as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginateFailure {
    NoAnswer,
    Busy,
    Congestion,
    Rejected(String),
}

/// Call progress notifications for one correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Progressing,
    Ringing,
    Answered,
    PlaybackStarted,
    PlaybackFinished,
    Hangup { cause: u16, text: String },
    OriginateFailed { reason: OriginateFailure },
}

/// Everything the client pushes to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A session is authenticated and subscribed to the event stream
    Connected,
    Call {
        correlation_id: CorrelationId,
        kind: EventKind,
    },
    /// The session dropped; no further events for calls in progress
    ConnectionLost,
}

/// Parameters of one originate command.
#[derive(Debug, Clone)]
pub struct OriginateRequest {
    pub correlation_id: CorrelationId,
    pub job_id: JobId,
    pub destination: String,
    pub caller_id: String,
    /// Sound name handed to the dial plan
    pub playback: String,
    pub extension: Option<String>,
    pub ring_timeout: Duration,
}

/// Health of the control session, surfaced on the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    /// Set once reconnecting failed `alarm_after_attempts` times in a row
    pub alarm: bool,
    pub reconnect_attempts: u32,
}

#[async_trait]
pub trait CallControl: Send + Sync {
    /// Send an originate command. Returns once the peer accepted or refused
    /// it; call progress is reported through the event feed.
    async fn originate(&self, request: OriginateRequest) -> CallResult<CorrelationId>;

    /// Ask the peer to tear the call down. Completion is confirmed by a
    /// `Hangup` event, not by this call returning.
    async fn hangup(&self, correlation_id: CorrelationId) -> CallResult<()>;

    fn status(&self) -> SessionStatus;
}
