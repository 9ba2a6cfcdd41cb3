use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::queue::AdmissionQueue;
use super::{CallHandle, CallOutcome, CallSnapshot, EngineConfig, EngineStats};
use crate::core::control::{CallControl, EventKind, OriginateRequest, PeerEvent};
use crate::core::history::{CallHistory, CallHistoryRecord};
use crate::core::lifecycle::{CallLifecycle, CallState, CancelOutcome, FailureReason};
use crate::core::model::{CallJob, CorrelationId, JobId, Ticket};
use crate::core::tts::Playback;
use crate::errors::{CallError, CallResult};

/// How many finished correlation ids are remembered to tell late events for
/// finished calls apart from genuinely unknown ones.
const RETIRED_CAPACITY: usize = 4096;

pub(super) enum EngineCommand {
    Submit {
        job: CallJob,
        playback: Playback,
        wait: bool,
        reply: oneshot::Sender<CallResult<CallHandle>>,
    },
    Reject {
        job: CallJob,
        reason: FailureReason,
        reply: oneshot::Sender<CallResult<CallHandle>>,
    },
    Cancel {
        ticket: Ticket,
        reply: oneshot::Sender<CallResult<CancelOutcome>>,
    },
    Status {
        ticket: Ticket,
        reply: oneshot::Sender<Option<CallSnapshot>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Messages the actor sends itself from spawned tasks.
enum Internal {
    OriginateDone {
        job_id: JobId,
        correlation_id: CorrelationId,
        result: CallResult<CorrelationId>,
    },
    RingTimeout {
        job_id: JobId,
        correlation_id: CorrelationId,
    },
}

struct BlockedSubmit {
    job: CallJob,
    playback: Playback,
    reply: oneshot::Sender<CallResult<CallHandle>>,
}

struct TrackedJob {
    job: CallJob,
    playback: Playback,
    lifecycle: CallLifecycle,
    correlation_ids: Vec<CorrelationId>,
    current: Option<CorrelationId>,
    /// Originate sent, peer has not answered the command yet
    originate_pending: bool,
    /// Counts against the concurrency limit
    holds_slot: bool,
    ring_timer: Option<AbortHandle>,
}

impl TrackedJob {
    fn new(job: CallJob, playback: Playback) -> Self {
        Self {
            job,
            playback,
            lifecycle: CallLifecycle::new(),
            correlation_ids: Vec::new(),
            current: None,
            originate_pending: false,
            holds_slot: false,
            ring_timer: None,
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            job_id: self.job.job_id,
            root_job_id: self.job.root_job_id(),
            destination: self.job.destination.clone(),
            broadcast_id: self.job.broadcast_id,
            attempt: self.job.attempt,
            state: self.lifecycle.state(),
            failure: self.lifecycle.failure().cloned(),
            correlation_id: self.current,
            transitions: self.lifecycle.transitions().to_vec(),
        }
    }

    fn history_record(&self) -> CallHistoryRecord {
        let ended_at = self
            .lifecycle
            .transitions()
            .last()
            .map(|t| t.at)
            .unwrap_or_else(chrono::Utc::now);
        let duration_secs = self
            .lifecycle
            .entered_at(CallState::Answered)
            .map(|answered| (ended_at - answered).num_seconds());

        CallHistoryRecord {
            job_id: self.job.job_id,
            attempt: self.job.attempt,
            broadcast_id: self.job.broadcast_id,
            destination: self.job.destination.clone(),
            caller_id: self.job.caller_id.clone(),
            correlation_ids: self.correlation_ids.clone(),
            transitions: self.lifecycle.transitions().to_vec(),
            final_state: self.lifecycle.state(),
            failure: self.lifecycle.failure().cloned(),
            started_at: self.job.created_at,
            ended_at,
            duration_secs,
        }
    }
}

/// Bounded memory of correlation ids whose calls already finished.
#[derive(Default)]
struct RetiredIds {
    order: VecDeque<CorrelationId>,
    set: HashSet<CorrelationId>,
}

impl RetiredIds {
    fn insert(&mut self, id: CorrelationId) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &CorrelationId) -> bool {
        self.set.contains(id)
    }
}

/// Map an originate command error onto the terminal failure reason.
fn failure_from_error(err: &CallError) -> FailureReason {
    match err {
        CallError::OriginateRejected { reason, transient } => FailureReason::OriginateRejected {
            reason: reason.clone(),
            transient: *transient,
        },
        CallError::ConnectionLost | CallError::NotConnected => FailureReason::ConnectionLost,
        CallError::NoAnswer => FailureReason::NoAnswer,
        CallError::ActionTimeout(_) => FailureReason::OriginateRejected {
            reason: "no response to originate".to_string(),
            transient: false,
        },
        other => FailureReason::OriginateRejected {
            reason: other.to_string(),
            transient: false,
        },
    }
}

pub(super) struct EngineActor {
    config: EngineConfig,
    control: Arc<dyn CallControl>,
    history: CallHistory,
    queue: AdmissionQueue,
    jobs: HashMap<JobId, TrackedJob>,
    by_correlation: HashMap<CorrelationId, JobId>,
    retired: RetiredIds,
    /// Root job id -> job id of the attempt currently tracked
    chain: HashMap<JobId, JobId>,
    /// Root job id -> whoever waits for the final outcome
    waiters: HashMap<JobId, oneshot::Sender<CallOutcome>>,
    blocked: VecDeque<BlockedSubmit>,
    connected: bool,
    /// Calls in progress when the session dropped; hung up on reconnect
    orphaned: Vec<CorrelationId>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl EngineActor {
    pub(super) fn new(config: EngineConfig, control: Arc<dyn CallControl>, history: CallHistory) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let queue = AdmissionQueue::new(config.concurrency_limit, config.max_queue_length);
        Self {
            config,
            control,
            history,
            queue,
            jobs: HashMap::new(),
            by_correlation: HashMap::new(),
            retired: RetiredIds::default(),
            chain: HashMap::new(),
            waiters: HashMap::new(),
            blocked: VecDeque::new(),
            connected: false,
            orphaned: Vec::new(),
            internal_tx,
            internal_rx,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut peer_events: mpsc::Receiver<PeerEvent>,
    ) {
        info!(
            concurrency_limit = self.queue.limit(),
            ring_timeout_secs = self.config.ring_timeout.as_secs(),
            "Call engine started"
        );
        let mut peer_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                event = peer_events.recv(), if peer_open => match event {
                    Some(event) => self.on_peer_event(event),
                    None => {
                        warn!("Call-control event feed closed");
                        peer_open = false;
                        self.on_peer_event(PeerEvent::ConnectionLost);
                    }
                },
            }
            self.pump();
        }

        info!(
            tracked = self.jobs.len(),
            "Call engine stopped, abandoning unfinished jobs"
        );
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Submit {
                job,
                playback,
                wait,
                reply,
            } => self.submit(job, playback, wait, reply),
            EngineCommand::Reject { job, reason, reply } => {
                let result = self.reject(job, reason);
                let _ = reply.send(result);
            }
            EngineCommand::Cancel { ticket, reply } => {
                let _ = reply.send(self.cancel(ticket));
            }
            EngineCommand::Status { ticket, reply } => {
                let _ = reply.send(self.status(ticket));
            }
            EngineCommand::Stats { reply } => {
                let _ = reply.send(EngineStats {
                    queued: self.queue.queued(),
                    in_flight: self.queue.in_flight(),
                    limit: self.queue.limit(),
                    waiting_submitters: self.blocked.len(),
                    connected: self.connected,
                });
            }
        }
    }

    fn is_known(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id) || self.history.contains(job_id)
    }

    fn submit(
        &mut self,
        job: CallJob,
        playback: Playback,
        wait: bool,
        reply: oneshot::Sender<CallResult<CallHandle>>,
    ) {
        if self.is_known(job.job_id) {
            let _ = reply.send(Err(CallError::InvalidRequest(format!(
                "job {} was already submitted",
                job.job_id
            ))));
            return;
        }

        if wait && !self.queue.has_room() {
            debug!(job_id = %job.job_id, "Queue full, holding submission");
            self.blocked.push_back(BlockedSubmit {
                job,
                playback,
                reply,
            });
            return;
        }

        let job_id = job.job_id;
        let result = self.accept(job, playback);
        if let Err(e) = &result {
            warn!(job_id = %job_id, error = %e, "Queue full, rejecting call");
        }
        let _ = reply.send(result);
    }

    /// Start tracking a job and give the submitter its handle.
    fn track(&mut self, job: CallJob, playback: Playback) -> CallHandle {
        let job_id = job.job_id;
        let root = job.root_job_id();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(root, tx);
        self.chain.insert(root, job_id);
        self.jobs.insert(job_id, TrackedJob::new(job, playback));
        CallHandle {
            ticket: job_id,
            outcome: rx,
        }
    }

    /// Queue a fresh job against the hard bound, then start tracking it.
    fn accept(&mut self, job: CallJob, playback: Playback) -> CallResult<CallHandle> {
        self.queue.enqueue(job.job_id)?;
        info!(
            job_id = %job.job_id,
            destination = %job.destination,
            broadcast_id = ?job.broadcast_id,
            "Call queued"
        );
        Ok(self.track(job, playback))
    }

    fn reject(&mut self, job: CallJob, reason: FailureReason) -> CallResult<CallHandle> {
        if self.is_known(job.job_id) {
            return Err(CallError::InvalidRequest(format!(
                "job {} was already submitted",
                job.job_id
            )));
        }
        let job_id = job.job_id;
        warn!(job_id = %job_id, reason = %reason, "Call failed before admission");
        let handle = self.track(job, Playback::recording(String::new()));
        if let Some(tracked) = self.jobs.get_mut(&job_id) {
            tracked.lifecycle.fail(reason);
        }
        self.finalize(job_id);
        Ok(handle)
    }

    fn cancel(&mut self, ticket: Ticket) -> CallResult<CancelOutcome> {
        let current = self.chain.get(&ticket).copied().unwrap_or(ticket);

        let Some(tracked) = self.jobs.get_mut(&current) else {
            return if self.history.contains(ticket) {
                Ok(CancelOutcome::AlreadyTerminal)
            } else {
                Err(CallError::UnknownTicket(ticket))
            };
        };

        let outcome = tracked.lifecycle.request_cancel();
        let hangup = match outcome {
            CancelOutcome::HangupRequired if !tracked.originate_pending => tracked.current,
            _ => None,
        };

        match outcome {
            CancelOutcome::Cancelled => {
                info!(job_id = %current, "Cancelled queued call");
                self.queue.remove(current);
                self.finalize(current);
            }
            CancelOutcome::HangupRequired => {
                info!(job_id = %current, "Cancelling live call");
                if let Some(correlation_id) = hangup {
                    self.send_hangup(correlation_id);
                }
            }
            CancelOutcome::AlreadyTerminal => {}
        }
        Ok(outcome)
    }

    fn status(&self, ticket: Ticket) -> Option<CallSnapshot> {
        let current = self.chain.get(&ticket).copied().unwrap_or(ticket);
        if let Some(tracked) = self.jobs.get(&current) {
            return Some(tracked.snapshot());
        }
        self.history
            .latest_attempt(ticket)
            .or_else(|| self.history.get(ticket))
            .map(|record| CallSnapshot::from(&record))
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Admit queued jobs into free slots and move held submissions into the
    /// queue as room appears.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;

            if self.connected {
                while let Some(job_id) = self.queue.admit_next() {
                    self.originate(job_id);
                    progressed = true;
                }
            }

            while self.queue.has_room() {
                let Some(blocked) = self.blocked.pop_front() else {
                    break;
                };
                if blocked.reply.is_closed() {
                    continue;
                }
                if self.is_known(blocked.job.job_id) {
                    let _ = blocked.reply.send(Err(CallError::InvalidRequest(format!(
                        "job {} was already submitted",
                        blocked.job.job_id
                    ))));
                    continue;
                }
                let result = self.accept(blocked.job, blocked.playback);
                let _ = blocked.reply.send(result);
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
    }

    fn originate(&mut self, job_id: JobId) {
        let Some(tracked) = self.jobs.get_mut(&job_id) else {
            self.queue.release();
            return;
        };

        tracked.holds_slot = true;
        tracked.lifecycle.admit();
        let correlation_id = CorrelationId::new();
        tracked.correlation_ids.push(correlation_id);
        tracked.current = Some(correlation_id);
        tracked.originate_pending = true;

        let request = OriginateRequest {
            correlation_id,
            job_id,
            destination: tracked.job.destination.clone(),
            caller_id: tracked.job.caller_id.clone(),
            playback: tracked.playback.name().to_string(),
            extension: tracked.job.extension.clone(),
            ring_timeout: self.config.ring_timeout,
        };
        info!(
            job_id = %job_id,
            correlation_id = %correlation_id,
            destination = %request.destination,
            "Originating call"
        );

        let ring_timeout = self.config.ring_timeout;
        let timer_tx = self.internal_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            let _ = timer_tx.send(Internal::RingTimeout {
                job_id,
                correlation_id,
            });
        });
        tracked.ring_timer = Some(timer.abort_handle());

        self.by_correlation.insert(correlation_id, job_id);

        let control = self.control.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = control.originate(request).await;
            let _ = tx.send(Internal::OriginateDone {
                job_id,
                correlation_id,
                result,
            });
        });
    }

    fn send_hangup(&self, correlation_id: CorrelationId) {
        let control = self.control.clone();
        tokio::spawn(async move {
            if let Err(e) = control.hangup(correlation_id).await {
                warn!(correlation_id = %correlation_id, "Hangup failed: {}", e);
            }
        });
    }

    // =========================================================================
    // Internal events
    // =========================================================================

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::OriginateDone {
                job_id,
                correlation_id,
                result,
            } => self.on_originate_done(job_id, correlation_id, result),
            Internal::RingTimeout {
                job_id,
                correlation_id,
            } => self.on_ring_timeout(job_id, correlation_id),
        }
    }

    fn on_originate_done(
        &mut self,
        job_id: JobId,
        correlation_id: CorrelationId,
        result: CallResult<CorrelationId>,
    ) {
        let Some(tracked) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if tracked.current != Some(correlation_id) {
            return;
        }
        tracked.originate_pending = false;

        match result {
            Ok(_) => {
                debug!(job_id = %job_id, correlation_id = %correlation_id, "Originate accepted");
                if tracked.lifecycle.cancel_requested() && !tracked.lifecycle.is_terminal() {
                    self.send_hangup(correlation_id);
                }
            }
            Err(e) => {
                warn!(job_id = %job_id, correlation_id = %correlation_id, "Originate failed: {}", e);
                let reason = failure_from_error(&e);
                let finished = tracked.lifecycle.fail(reason).is_some();
                // The peer may still place a call it never confirmed
                if matches!(e, CallError::ActionTimeout(_)) {
                    self.send_hangup(correlation_id);
                }
                if finished {
                    self.finalize(job_id);
                }
            }
        }
    }

    fn on_ring_timeout(&mut self, job_id: JobId, correlation_id: CorrelationId) {
        let Some(tracked) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if tracked.current != Some(correlation_id) {
            return;
        }
        tracked.ring_timer = None;
        if tracked.lifecycle.ring_timeout().is_some() {
            info!(job_id = %job_id, correlation_id = %correlation_id, "No answer within ring timeout");
            self.send_hangup(correlation_id);
            self.finalize(job_id);
        }
    }

    // =========================================================================
    // Peer events
    // =========================================================================

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected => {
                info!("Call-control peer connected, admission open");
                self.connected = true;
                for correlation_id in std::mem::take(&mut self.orphaned) {
                    self.send_hangup(correlation_id);
                }
            }
            PeerEvent::ConnectionLost => self.on_connection_lost(),
            PeerEvent::Call {
                correlation_id,
                kind,
            } => self.on_call_event(correlation_id, kind),
        }
    }

    fn on_connection_lost(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;

        let live: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, tracked)| tracked.holds_slot && !tracked.lifecycle.is_terminal())
            .map(|(job_id, _)| *job_id)
            .collect();
        warn!(
            live_calls = live.len(),
            queued = self.queue.queued(),
            "Call-control peer lost, admission paused"
        );

        for job_id in live {
            if let Some(tracked) = self.jobs.get_mut(&job_id) {
                if let Some(correlation_id) = tracked.current {
                    self.orphaned.push(correlation_id);
                }
                if tracked.lifecycle.connection_lost().is_some() {
                    self.finalize(job_id);
                }
            }
        }
    }

    fn on_call_event(&mut self, correlation_id: CorrelationId, kind: EventKind) {
        let Some(&job_id) = self.by_correlation.get(&correlation_id) else {
            if self.retired.contains(&correlation_id) {
                debug!(correlation_id = %correlation_id, ?kind, "Event for finished call ignored");
            } else {
                let err = CallError::ProtocolDesync(format!(
                    "event {kind:?} for unknown correlation id {correlation_id}"
                ));
                warn!("{}", err);
            }
            return;
        };
        let Some(tracked) = self.jobs.get_mut(&job_id) else {
            return;
        };

        let Some(state) = tracked.lifecycle.on_event(&kind) else {
            debug!(job_id = %job_id, ?kind, "Event did not change call state");
            return;
        };
        debug!(job_id = %job_id, correlation_id = %correlation_id, state = %state, "Call state changed");

        if state == CallState::Answered {
            if let Some(timer) = tracked.ring_timer.take() {
                timer.abort();
            }
        }
        if state.is_terminal() {
            self.finalize(job_id);
        }
    }

    // =========================================================================
    // Terminal handling
    // =========================================================================

    /// Release everything a job held, record it, and either schedule its
    /// retry or resolve the outcome of the logical call.
    fn finalize(&mut self, job_id: JobId) {
        let Some(mut tracked) = self.jobs.remove(&job_id) else {
            return;
        };
        if let Some(timer) = tracked.ring_timer.take() {
            timer.abort();
        }
        if let Some(correlation_id) = tracked.current {
            self.by_correlation.remove(&correlation_id);
            self.retired.insert(correlation_id);
        }
        if tracked.holds_slot {
            self.queue.release();
        }

        let state = tracked.lifecycle.state();
        let failure = tracked.lifecycle.failure().cloned();
        match &failure {
            Some(reason) => info!(job_id = %job_id, state = %state, reason = %reason, "Call finished"),
            None => info!(job_id = %job_id, state = %state, "Call finished"),
        }
        if let Err(e) = self.history.record(tracked.history_record()) {
            warn!(job_id = %job_id, "Failed to record call history: {}", e);
        }

        let root = tracked.job.root_job_id();
        let retryable = state == CallState::Failed
            && tracked.job.can_retry()
            && failure
                .as_ref()
                .is_some_and(|reason| reason.is_retryable(self.config.retry_no_answer));

        if retryable {
            let retry = tracked.job.retry();
            let retry_id = retry.job_id;
            info!(
                job_id = %retry_id,
                original_job_id = %root,
                "Scheduling retry at the back of the queue"
            );
            self.chain.insert(root, retry_id);
            self.jobs.insert(retry_id, TrackedJob::new(retry, tracked.playback));
            self.queue.enqueue_unbounded(retry_id);
            return;
        }

        self.chain.remove(&root);
        if let Some(waiter) = self.waiters.remove(&root) {
            let attempts = if tracked.job.attempt.is_retry() { 2 } else { 1 };
            let _ = waiter.send(CallOutcome {
                job_id: root,
                final_job_id: job_id,
                state,
                failure,
                attempts,
            });
        }
    }
}
