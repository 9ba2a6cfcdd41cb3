//! Per-call lifecycle tracking.
//!
//! ```text
//! Queued -> Originating -> Ringing -> Answered -> Playing -> Completed
//!    \            \            \          \          \
//!     +------------+------------+----------+----------+--> Failed | Cancelled
//! ```
//!
//! Transitions are monotonic: an event that would move the call backwards
//! (a late `Ringing` after `Answered`, anything after a terminal state) is
//! ignored. The lifecycle only changes through call-control events, the ring
//! timer, or explicit cancellation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::control::{EventKind, OriginateFailure};

/// Hangup cause codes (Q.850) that carry a specific meaning before answer.
const CAUSE_USER_BUSY: u16 = 17;
const CAUSE_NO_USER_RESPONSE: u16 = 18;
const CAUSE_NO_ANSWER: u16 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Queued,
    Originating,
    Ringing,
    Answered,
    Playing,
    Completed,
    Failed,
    Cancelled,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Completed | CallState::Failed | CallState::Cancelled
        )
    }

    /// Position along the happy path; all terminal states share the top rank.
    fn rank(&self) -> u8 {
        match self {
            CallState::Queued => 0,
            CallState::Originating => 1,
            CallState::Ringing => 2,
            CallState::Answered => 3,
            CallState::Playing => 4,
            CallState::Completed | CallState::Failed | CallState::Cancelled => 5,
        }
    }

    pub fn can_transition_to(&self, next: CallState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Queued => "queued",
            CallState::Originating => "originating",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::Playing => "playing",
            CallState::Completed => "completed",
            CallState::Failed => "failed",
            CallState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    OriginateRejected { reason: String, transient: bool },
    NoAnswer,
    Busy,
    PeerHangup { cause: u16, text: String },
    ConnectionLost,
    SynthesisFailed { detail: String },
}

impl FailureReason {
    /// Whether this failure qualifies for the single automatic retry.
    pub fn is_retryable(&self, retry_no_answer: bool) -> bool {
        match self {
            FailureReason::ConnectionLost | FailureReason::Busy => true,
            FailureReason::OriginateRejected { transient, .. } => *transient,
            FailureReason::NoAnswer => retry_no_answer,
            FailureReason::PeerHangup { .. } | FailureReason::SynthesisFailed { .. } => false,
        }
    }

    fn from_early_hangup(cause: u16, text: &str) -> Self {
        match cause {
            CAUSE_USER_BUSY => FailureReason::Busy,
            CAUSE_NO_USER_RESPONSE | CAUSE_NO_ANSWER => FailureReason::NoAnswer,
            _ => FailureReason::PeerHangup {
                cause,
                text: text.to_string(),
            },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::OriginateRejected { reason, .. } => {
                write!(f, "originate rejected: {reason}")
            }
            FailureReason::NoAnswer => write!(f, "no answer"),
            FailureReason::Busy => write!(f, "busy"),
            FailureReason::PeerHangup { cause, text } => write!(f, "hangup cause {cause} ({text})"),
            FailureReason::ConnectionLost => write!(f, "connection lost"),
            FailureReason::SynthesisFailed { detail } => write!(f, "synthesis failed: {detail}"),
        }
    }
}

impl From<OriginateFailure> for FailureReason {
    fn from(failure: OriginateFailure) -> Self {
        match failure {
            OriginateFailure::NoAnswer => FailureReason::NoAnswer,
            OriginateFailure::Busy => FailureReason::Busy,
            OriginateFailure::Congestion => FailureReason::OriginateRejected {
                reason: "congestion".to_string(),
                transient: true,
            },
            OriginateFailure::Rejected(reason) => FailureReason::OriginateRejected {
                reason,
                transient: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: CallState,
    pub at: DateTime<Utc>,
}

/// What the engine has to do after a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was never originated and is now `Cancelled`
    Cancelled,
    /// The call is live; a hang-up has to be sent and confirmed
    HangupRequired,
    /// Nothing to do, the call already ended
    AlreadyTerminal,
}

#[derive(Debug, Clone)]
pub struct CallLifecycle {
    state: CallState,
    transitions: Vec<StateTransition>,
    playback_finished: bool,
    cancel_requested: bool,
    failure: Option<FailureReason>,
}

impl Default for CallLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CallLifecycle {
    pub fn new() -> Self {
        Self {
            state: CallState::Queued,
            transitions: vec![StateTransition {
                state: CallState::Queued,
                at: Utc::now(),
            }],
            playback_finished: false,
            cancel_requested: false,
            failure: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Time of the first entry into `state`, if it was ever reached.
    pub fn entered_at(&self, state: CallState) -> Option<DateTime<Utc>> {
        self.transitions
            .iter()
            .find(|t| t.state == state)
            .map(|t| t.at)
    }

    fn move_to(&mut self, next: CallState) -> Option<CallState> {
        if !self.state.can_transition_to(next) {
            tracing::debug!(from = %self.state, to = %next, "Ignoring non-monotonic transition");
            return None;
        }
        self.state = next;
        self.transitions.push(StateTransition {
            state: next,
            at: Utc::now(),
        });
        Some(next)
    }

    /// Queued -> Originating, once admission granted a slot.
    pub fn admit(&mut self) -> Option<CallState> {
        if self.state != CallState::Queued {
            return None;
        }
        self.move_to(CallState::Originating)
    }

    /// Move to `Failed`, or `Cancelled` if a cancellation is pending.
    pub fn fail(&mut self, reason: FailureReason) -> Option<CallState> {
        if self.is_terminal() {
            return None;
        }
        if self.cancel_requested {
            return self.move_to(CallState::Cancelled);
        }
        self.failure = Some(reason);
        self.move_to(CallState::Failed)
    }

    pub fn on_event(&mut self, kind: &EventKind) -> Option<CallState> {
        if self.is_terminal() {
            return None;
        }
        match kind {
            // Progress only confirms the originate; Originating already covers it
            EventKind::Progressing => None,
            EventKind::Ringing => self.move_to(CallState::Ringing),
            EventKind::Answered => self.move_to(CallState::Answered),
            EventKind::PlaybackStarted => self.move_to(CallState::Playing),
            EventKind::PlaybackFinished => {
                if self.state.rank() >= CallState::Answered.rank() {
                    self.playback_finished = true;
                }
                None
            }
            EventKind::Hangup { cause, text } => self.on_hangup(*cause, text),
            EventKind::OriginateFailed { reason } => self.fail(reason.clone().into()),
        }
    }

    fn on_hangup(&mut self, cause: u16, text: &str) -> Option<CallState> {
        if self.playback_finished {
            return self.move_to(CallState::Completed);
        }
        if self.cancel_requested {
            return self.move_to(CallState::Cancelled);
        }
        if self.state.rank() >= CallState::Answered.rank() {
            self.fail(FailureReason::PeerHangup {
                cause,
                text: text.to_string(),
            })
        } else {
            self.fail(FailureReason::from_early_hangup(cause, text))
        }
    }

    /// Ring timer expiry. Only meaningful before the call was answered.
    pub fn ring_timeout(&mut self) -> Option<CallState> {
        if self.state.rank() >= CallState::Answered.rank() {
            return None;
        }
        self.fail(FailureReason::NoAnswer)
    }

    /// The control session dropped before a terminal event arrived.
    pub fn connection_lost(&mut self) -> Option<CallState> {
        self.fail(FailureReason::ConnectionLost)
    }

    pub fn request_cancel(&mut self) -> CancelOutcome {
        match self.state {
            CallState::Queued => {
                self.move_to(CallState::Cancelled);
                CancelOutcome::Cancelled
            }
            state if state.is_terminal() => CancelOutcome::AlreadyTerminal,
            _ => {
                self.cancel_requested = true;
                CancelOutcome::HangupRequired
            }
        }
    }
}
