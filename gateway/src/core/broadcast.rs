//! Broadcast dispatcher.
//!
//! A broadcast expands into one independent child job per destination. The
//! children go through the same admission queue as single calls; the
//! dispatcher only tracks them and folds their outcomes into an aggregate once
//! every child is terminal. A failure of one child never affects its siblings.
//! Finished broadcasts move from the live registry into [`BroadcastHistory`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::core::directory::Directory;
use crate::core::engine::{CallEngine, CallHandle};
use crate::core::history::BroadcastHistory;
use crate::core::lifecycle::{CallState, FailureReason};
use crate::core::model::{BroadcastId, CallJob, JobId, MessageSpec};
use crate::core::notify::{EventNotifier, GatewayEvent};
use crate::core::tts::TtsCache;
use crate::errors::{CallError, CallResult};
use crate::utils::validate_phone_number;

/// Most recent broadcasts returned by `list`
pub const BROADCAST_LIST_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct BroadcastRequest {
    pub name: String,
    /// Explicit destinations, expanded before the group's members
    pub numbers: Vec<String>,
    pub group: Option<String>,
    pub message: MessageSpec,
    pub caller_id: Option<String>,
    /// Children of this broadcast allowed in flight at once
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Initiated,
    Processing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Every child completed
    Success,
    /// Some children completed
    Partial,
    /// No child completed
    Failed,
}

impl AggregateStatus {
    pub fn from_states(states: impl IntoIterator<Item = CallState>) -> Option<Self> {
        let mut total = 0usize;
        let mut completed = 0usize;
        for state in states {
            total += 1;
            if state == CallState::Completed {
                completed += 1;
            }
        }
        match (total, completed) {
            (0, _) => None,
            (t, c) if t == c => Some(AggregateStatus::Success),
            (_, 0) => Some(AggregateStatus::Failed),
            _ => Some(AggregateStatus::Partial),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub broadcast_id: BroadcastId,
    pub name: String,
    pub status: BroadcastStatus,
    pub aggregate: Option<AggregateStatus>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_progress: usize,
    /// Child tickets in submission order
    pub job_ids: Vec<JobId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Expanded, validated form of a request.
struct BroadcastPlan {
    broadcast_id: BroadcastId,
    destinations: Vec<String>,
    caller_id: String,
    message: MessageSpec,
    concurrency: Option<usize>,
}

#[derive(Clone)]
pub struct BroadcastDispatcher {
    engine: CallEngine,
    cache: Arc<TtsCache>,
    directory: Arc<Directory>,
    default_caller_id: String,
    /// Broadcasts still running
    registry: Arc<DashMap<BroadcastId, BroadcastRecord>>,
    history: BroadcastHistory,
    notifier: EventNotifier,
}

impl BroadcastDispatcher {
    pub fn new(
        engine: CallEngine,
        cache: Arc<TtsCache>,
        directory: Arc<Directory>,
        default_caller_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            cache,
            directory,
            default_caller_id: default_caller_id.into(),
            registry: Arc::new(DashMap::new()),
            history: BroadcastHistory::in_memory(),
            notifier: EventNotifier::disabled(),
        }
    }

    pub fn with_history(mut self, history: BroadcastHistory) -> Self {
        self.history = history;
        self
    }

    pub fn with_notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Validate and expand the request, register it and start submitting its
    /// children in the background. Returns the initial record.
    pub fn dispatch(&self, request: BroadcastRequest) -> CallResult<BroadcastRecord> {
        let mut destinations = Vec::with_capacity(request.numbers.len());
        for number in &request.numbers {
            let normalized = validate_phone_number(number)
                .map_err(|e| CallError::InvalidRequest(e.to_string()))?;
            destinations.push(normalized);
        }

        let group = match request.group.as_deref().filter(|g| !g.trim().is_empty()) {
            Some(name) => Some(self.directory.group(name)?),
            None => None,
        };
        if let Some(group) = &group {
            destinations.extend(group.numbers.iter().cloned());
        }

        if destinations.is_empty() {
            return Err(CallError::InvalidRequest(
                "broadcast has no destinations".to_string(),
            ));
        }
        if request.concurrency == Some(0) {
            return Err(CallError::InvalidRequest(
                "concurrent_calls must be at least 1".to_string(),
            ));
        }

        let caller_id = request
            .caller_id
            .filter(|c| !c.trim().is_empty())
            .or_else(|| group.and_then(|g| g.caller_id))
            .unwrap_or_else(|| self.default_caller_id.clone());

        let broadcast_id = BroadcastId::new();
        let name = if request.name.trim().is_empty() {
            format!("broadcast-{broadcast_id}")
        } else {
            request.name
        };
        let record = BroadcastRecord {
            broadcast_id,
            name,
            status: BroadcastStatus::Initiated,
            aggregate: None,
            total: destinations.len(),
            completed: 0,
            failed: 0,
            cancelled: 0,
            in_progress: 0,
            job_ids: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        };
        self.registry.insert(broadcast_id, record.clone());
        info!(
            broadcast_id = %broadcast_id,
            total = record.total,
            "Broadcast initiated"
        );

        let plan = BroadcastPlan {
            broadcast_id,
            destinations,
            caller_id,
            message: request.message,
            concurrency: request.concurrency,
        };
        tokio::spawn(self.clone().run(plan));

        Ok(record)
    }

    fn update(&self, broadcast_id: BroadcastId, apply: impl FnOnce(&mut BroadcastRecord)) {
        if let Some(mut record) = self.registry.get_mut(&broadcast_id) {
            apply(record.value_mut());
        }
    }

    async fn run(self, plan: BroadcastPlan) {
        let broadcast_id = plan.broadcast_id;
        let mut started = None;
        self.update(broadcast_id, |r| {
            r.status = BroadcastStatus::Processing;
            started = Some(GatewayEvent::BroadcastStarted {
                broadcast_id,
                name: r.name.clone(),
                total_numbers: r.total,
            });
        });
        if let Some(event) = started {
            self.notifier.notify(event);
        }

        // One synthesis for the whole broadcast; each child holds its own lease
        let playback = self.cache.playback(&plan.message).await;
        if let Err(e) = &playback {
            warn!(broadcast_id = %broadcast_id, "Broadcast message unavailable: {}", e);
        }

        let limiter = plan.concurrency.map(|n| Arc::new(Semaphore::new(n)));
        let mut children: JoinSet<CallResult<CallState>> = JoinSet::new();

        for destination in plan.destinations {
            let permit = match &limiter {
                Some(limiter) => match limiter.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => None,
                },
                None => None,
            };

            let job = CallJob::new(destination, plan.caller_id.clone(), plan.message.clone())
                .with_broadcast(broadcast_id);
            let job_id = job.job_id;

            let submitted: CallResult<CallHandle> = match &playback {
                Ok(playback) => self.engine.submit_waiting(job, playback.clone()).await,
                Err(e) => {
                    let reason = FailureReason::SynthesisFailed {
                        detail: e.to_string(),
                    };
                    self.engine.reject(job, reason).await
                }
            };

            match submitted {
                Ok(handle) => {
                    self.update(broadcast_id, |r| {
                        r.job_ids.push(job_id);
                        r.in_progress += 1;
                    });
                    children.spawn(async move {
                        let outcome = handle.outcome().await;
                        drop(permit);
                        outcome.map(|o| o.state)
                    });
                }
                Err(e) => {
                    error!(broadcast_id = %broadcast_id, job_id = %job_id, "Failed to submit broadcast call: {}", e);
                    self.update(broadcast_id, |r| r.failed += 1);
                }
            }
        }

        while let Some(joined) = children.join_next().await {
            let state = match joined {
                Ok(Ok(state)) => state,
                Ok(Err(e)) => {
                    warn!(broadcast_id = %broadcast_id, "Lost track of broadcast call: {}", e);
                    CallState::Failed
                }
                Err(e) => {
                    error!(broadcast_id = %broadcast_id, "Broadcast child task failed: {}", e);
                    CallState::Failed
                }
            };
            self.update(broadcast_id, |r| {
                r.in_progress = r.in_progress.saturating_sub(1);
                match state {
                    CallState::Completed => r.completed += 1,
                    CallState::Cancelled => r.cancelled += 1,
                    _ => r.failed += 1,
                }
            });
        }

        self.update(broadcast_id, |r| {
            let states = std::iter::repeat_n(CallState::Completed, r.completed)
                .chain(std::iter::repeat_n(CallState::Failed, r.failed + r.cancelled));
            r.aggregate = AggregateStatus::from_states(states);
            r.status = BroadcastStatus::Done;
            r.completed_at = Some(Utc::now());
        });
        self.finish(broadcast_id);
    }

    /// Move a done broadcast into history. It is recorded before it leaves the
    /// registry so lookups never miss it.
    fn finish(&self, broadcast_id: BroadcastId) {
        let Some(record) = self.get_active(broadcast_id) else {
            return;
        };
        info!(
            broadcast_id = %broadcast_id,
            completed = record.completed,
            failed = record.failed,
            cancelled = record.cancelled,
            aggregate = ?record.aggregate,
            "Broadcast finished"
        );

        let event = GatewayEvent::BroadcastCompleted {
            broadcast_id,
            name: record.name.clone(),
            total: record.total,
            completed: record.completed,
            failed: record.failed + record.cancelled,
            aggregate: record.aggregate,
        };
        if let Err(e) = self.history.record(record) {
            error!(broadcast_id = %broadcast_id, "Failed to record broadcast: {}", e);
        }
        self.registry.remove(&broadcast_id);
        self.notifier.notify(event);
    }

    fn get_active(&self, broadcast_id: BroadcastId) -> Option<BroadcastRecord> {
        self.registry.get(&broadcast_id).map(|r| r.value().clone())
    }

    pub fn get(&self, broadcast_id: BroadcastId) -> Option<BroadcastRecord> {
        self.get_active(broadcast_id)
            .or_else(|| self.history.get(broadcast_id))
    }

    /// Running and finished broadcasts, newest first, at most
    /// [`BROADCAST_LIST_LIMIT`].
    pub fn list(&self) -> Vec<BroadcastRecord> {
        let mut records: Vec<BroadcastRecord> =
            self.registry.iter().map(|r| r.value().clone()).collect();
        for finished in self.history.recent(BROADCAST_LIST_LIMIT) {
            if !records.iter().any(|r| r.broadcast_id == finished.broadcast_id) {
                records.push(finished);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(BROADCAST_LIST_LIMIT);
        records
    }

    /// Broadcasts still running.
    pub fn active(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_from_child_states() {
        use CallState::*;

        assert_eq!(
            AggregateStatus::from_states([Completed, Completed]),
            Some(AggregateStatus::Success)
        );
        assert_eq!(
            AggregateStatus::from_states([Completed, Failed, Completed]),
            Some(AggregateStatus::Partial)
        );
        assert_eq!(
            AggregateStatus::from_states([Failed, Cancelled]),
            Some(AggregateStatus::Failed)
        );
        assert_eq!(AggregateStatus::from_states(std::iter::empty()), None);
    }
}
