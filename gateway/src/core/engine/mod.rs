//! Call engine: admission control and per-call state tracking.
//!
//! A single actor task owns the FIFO queue, the in-flight set and the
//! correlation map. Submissions, cancellations, peer events and timer expiries
//! are all messages to that task, so every state transition for every job is
//! applied in one place and in arrival order. [`CallEngine`] is the cloneable
//! handle the rest of the service talks to.

mod actor;
mod queue;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::core::control::{CallControl, PeerEvent};
use crate::core::history::{CallHistory, CallHistoryRecord};
use crate::core::lifecycle::{CallState, CancelOutcome, FailureReason, StateTransition};
use crate::core::model::{Attempt, BroadcastId, CallJob, CorrelationId, JobId, Ticket};
use crate::core::tts::Playback;
use crate::errors::{CallError, CallResult};

use actor::{EngineActor, EngineCommand};

pub use queue::AdmissionQueue;

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of calls between admission and a terminal state
    pub concurrency_limit: usize,
    /// Hard bound on queued jobs; unbounded when `None`
    pub max_queue_length: Option<usize>,
    pub ring_timeout: Duration,
    /// Treat an unanswered call as retryable
    pub retry_no_answer: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            max_queue_length: None,
            ring_timeout: Duration::from_secs(45),
            retry_no_answer: false,
        }
    }
}

/// Final result of a logical call, after any automatic retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallOutcome {
    /// Ticket the call was submitted under
    pub job_id: JobId,
    /// Job id of the attempt that produced the outcome
    pub final_job_id: JobId,
    pub state: CallState,
    pub failure: Option<FailureReason>,
    pub attempts: u8,
}

/// Returned on successful submission.
#[derive(Debug)]
pub struct CallHandle {
    ticket: Ticket,
    outcome: oneshot::Receiver<CallOutcome>,
}

impl CallHandle {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Wait for the call to finish.
    pub async fn outcome(self) -> CallResult<CallOutcome> {
        self.outcome.await.map_err(|_| CallError::EngineStopped)
    }
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub job_id: JobId,
    pub root_job_id: JobId,
    pub destination: String,
    pub broadcast_id: Option<BroadcastId>,
    pub attempt: Attempt,
    pub state: CallState,
    pub failure: Option<FailureReason>,
    pub correlation_id: Option<CorrelationId>,
    pub transitions: Vec<StateTransition>,
}

impl From<&CallHistoryRecord> for CallSnapshot {
    fn from(record: &CallHistoryRecord) -> Self {
        Self {
            job_id: record.job_id,
            root_job_id: record.root_job_id(),
            destination: record.destination.clone(),
            broadcast_id: record.broadcast_id,
            attempt: record.attempt,
            state: record.final_state,
            failure: record.failure.clone(),
            correlation_id: record.correlation_ids.last().copied(),
            transitions: record.transitions.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub queued: usize,
    pub in_flight: usize,
    pub limit: usize,
    /// Submitters suspended on a full queue
    pub waiting_submitters: usize,
    pub connected: bool,
}

#[derive(Clone)]
pub struct CallEngine {
    commands: mpsc::Sender<EngineCommand>,
}

impl CallEngine {
    /// Start the engine task. `peer_events` is the feed handed to the
    /// call-control client.
    pub fn spawn(
        config: EngineConfig,
        control: Arc<dyn CallControl>,
        history: CallHistory,
        peer_events: mpsc::Receiver<PeerEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = EngineActor::new(config, control, history);
        tokio::spawn(actor.run(rx, peer_events));
        Self { commands: tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> CallResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    /// Enqueue a job. Fails with `CapacityExceeded` when the queue is at its
    /// hard bound.
    pub async fn submit(&self, job: CallJob, playback: Playback) -> CallResult<CallHandle> {
        self.request(|reply| EngineCommand::Submit {
            job,
            playback,
            wait: false,
            reply,
        })
        .await?
    }

    /// Enqueue a job, suspending until the queue has room.
    pub async fn submit_waiting(&self, job: CallJob, playback: Playback) -> CallResult<CallHandle> {
        self.request(|reply| EngineCommand::Submit {
            job,
            playback,
            wait: true,
            reply,
        })
        .await?
    }

    /// Record a job that failed before it could be admitted, such as one
    /// whose message could not be synthesized.
    pub async fn reject(&self, job: CallJob, reason: FailureReason) -> CallResult<CallHandle> {
        self.request(|reply| EngineCommand::Reject { job, reason, reply })
            .await?
    }

    pub async fn cancel(&self, ticket: Ticket) -> CallResult<CancelOutcome> {
        self.request(|reply| EngineCommand::Cancel { ticket, reply })
            .await?
    }

    pub async fn status(&self, ticket: Ticket) -> CallResult<Option<CallSnapshot>> {
        self.request(|reply| EngineCommand::Status { ticket, reply })
            .await
    }

    pub async fn stats(&self) -> CallResult<EngineStats> {
        self.request(|reply| EngineCommand::Stats { reply }).await
    }
}
