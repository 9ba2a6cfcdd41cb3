//! Service facade tying the engine, the audio cache, the history and the
//! broadcast dispatcher together. The HTTP surface talks only to this.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::core::broadcast::{BroadcastDispatcher, BroadcastRecord, BroadcastRequest};
use crate::core::control::{CallControl, PeerEvent, SessionStatus};
use crate::core::directory::Directory;
use crate::core::engine::{CallEngine, CallHandle, CallSnapshot, EngineConfig, EngineStats};
use crate::core::history::{BroadcastHistory, CallHistory, CallHistoryRecord};
use crate::core::lifecycle::{CancelOutcome, FailureReason};
use crate::core::model::{BroadcastId, CallJob, ContactGroup, MessageSpec, Priority, Ticket};
use crate::core::notify::{EventNotifier, GatewayEvent};
use crate::core::tts::TtsCache;
use crate::errors::{CallError, CallResult};
use crate::utils::validate_phone_number;

/// A single call as requested by a client.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub destination: String,
    pub message: MessageSpec,
    pub caller_id: Option<String>,
    pub extension: Option<String>,
    pub max_retries: Option<u8>,
    pub priority: Option<Priority>,
}

impl CallRequest {
    pub fn new(destination: impl Into<String>, message: MessageSpec) -> Self {
        Self {
            destination: destination.into(),
            message,
            caller_id: None,
            extension: None,
            max_retries: None,
            priority: None,
        }
    }
}

/// Everything the service needs, built by the caller.
pub struct ServiceParts {
    pub engine: EngineConfig,
    pub control: Arc<dyn CallControl>,
    pub peer_events: mpsc::Receiver<PeerEvent>,
    pub cache: Arc<TtsCache>,
    pub history: CallHistory,
    pub broadcast_history: BroadcastHistory,
    pub notifier: EventNotifier,
    pub directory: Directory,
    pub default_caller_id: String,
}

pub struct PhoneService {
    engine: CallEngine,
    control: Arc<dyn CallControl>,
    cache: Arc<TtsCache>,
    history: CallHistory,
    broadcast_history: BroadcastHistory,
    notifier: EventNotifier,
    directory: Arc<Directory>,
    broadcasts: BroadcastDispatcher,
    default_caller_id: String,
}

fn validate_caller_id(caller_id: &str) -> CallResult<()> {
    if caller_id.chars().any(|c| c.is_control()) {
        return Err(CallError::InvalidRequest(
            "caller id contains control characters".to_string(),
        ));
    }
    Ok(())
}

impl PhoneService {
    /// Start the engine and wire the components together.
    pub fn start(parts: ServiceParts) -> Self {
        let engine = CallEngine::spawn(
            parts.engine,
            parts.control.clone(),
            parts.history.clone(),
            parts.peer_events,
        );
        let directory = Arc::new(parts.directory);
        let broadcasts = BroadcastDispatcher::new(
            engine.clone(),
            parts.cache.clone(),
            directory.clone(),
            parts.default_caller_id.clone(),
        )
        .with_history(parts.broadcast_history.clone())
        .with_notifier(parts.notifier.clone());

        Self {
            engine,
            control: parts.control,
            cache: parts.cache,
            history: parts.history,
            broadcast_history: parts.broadcast_history,
            notifier: parts.notifier,
            directory,
            broadcasts,
            default_caller_id: parts.default_caller_id,
        }
    }

    /// Validate, resolve the message and submit. A message that cannot be
    /// synthesized still produces a ticket whose job is recorded as failed.
    pub async fn place_call(&self, request: CallRequest) -> CallResult<CallHandle> {
        let destination = validate_phone_number(&request.destination)
            .map_err(|e| CallError::InvalidRequest(e.to_string()))?;
        if let Some(extension) = &request.extension {
            self.directory.extension(extension)?;
        }
        let caller_id = request
            .caller_id
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.default_caller_id.clone());
        validate_caller_id(&caller_id)?;

        let mut job = CallJob::new(destination, caller_id, request.message)
            .with_max_retries(request.max_retries.unwrap_or(1));
        if let Some(priority) = request.priority {
            job = job.with_priority(priority);
        }
        if let Some(extension) = request.extension {
            job = job.with_extension(extension);
        }

        match self.cache.playback(&job.message).await {
            Ok(playback) => {
                let phone_number = job.destination.clone();
                let handle = self.engine.submit(job, playback).await?;
                self.notifier.notify(GatewayEvent::CallInitiated {
                    call_id: handle.ticket(),
                    phone_number,
                    timestamp: Utc::now(),
                });
                Ok(handle)
            }
            Err(CallError::InvalidRequest(message)) => Err(CallError::InvalidRequest(message)),
            Err(e) => {
                warn!(job_id = %job.job_id, "Message synthesis failed: {}", e);
                let reason = FailureReason::SynthesisFailed {
                    detail: e.to_string(),
                };
                self.engine.reject(job, reason).await
            }
        }
    }

    pub fn dispatch_broadcast(&self, request: BroadcastRequest) -> CallResult<BroadcastRecord> {
        if let Some(caller_id) = &request.caller_id {
            validate_caller_id(caller_id)?;
        }
        self.broadcasts.dispatch(request)
    }

    pub async fn cancel(&self, ticket: Ticket) -> CallResult<CancelOutcome> {
        self.engine.cancel(ticket).await
    }

    pub async fn status(&self, ticket: Ticket) -> CallResult<CallSnapshot> {
        self.engine
            .status(ticket)
            .await?
            .ok_or(CallError::UnknownTicket(ticket))
    }

    pub async fn stats(&self) -> CallResult<EngineStats> {
        self.engine.stats().await
    }

    pub fn history(&self, limit: usize) -> Vec<CallHistoryRecord> {
        self.history.recent(limit)
    }

    pub fn broadcast(&self, broadcast_id: BroadcastId) -> Option<BroadcastRecord> {
        self.broadcasts.get(broadcast_id)
    }

    pub fn broadcasts(&self) -> Vec<BroadcastRecord> {
        self.broadcasts.list()
    }

    pub fn groups(&self) -> Vec<ContactGroup> {
        self.directory.groups()
    }

    pub fn add_group(&self, group: ContactGroup) -> CallResult<ContactGroup> {
        self.directory.add_group(group)
    }

    pub fn session_status(&self) -> SessionStatus {
        self.control.status()
    }

    pub fn call_history(&self) -> &CallHistory {
        &self.history
    }

    pub fn broadcast_history(&self) -> &BroadcastHistory {
        &self.broadcast_history
    }
}
