//! Scripted in-process call-control peer for engine tests.
//!
//! Originate requests are recorded and accepted (or refused for scripted
//! destinations); the test drives call progress by pushing events back
//! through the same feed the real client would use.

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use outcall_gateway::core::control::{
    CallControl, EventKind, OriginateRequest, PeerEvent, SessionStatus,
};
use outcall_gateway::core::engine::{CallEngine, EngineConfig, EngineStats};
use outcall_gateway::core::history::CallHistory;
use outcall_gateway::core::model::CorrelationId;
use outcall_gateway::errors::{CallError, CallResult};

pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub struct MockPeer {
    events: mpsc::Sender<PeerEvent>,
    originated: Mutex<Vec<OriginateRequest>>,
    hangups: Mutex<Vec<CorrelationId>>,
    refused: Mutex<HashSet<String>>,
}

impl MockPeer {
    pub fn new(events: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            events,
            originated: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
        }
    }

    pub fn refuse(&self, destination: &str) {
        self.refused.lock().insert(destination.to_string());
    }

    pub fn originated(&self) -> Vec<OriginateRequest> {
        self.originated.lock().clone()
    }

    pub fn originated_count(&self) -> usize {
        self.originated.lock().len()
    }

    pub fn hangups(&self) -> Vec<CorrelationId> {
        self.hangups.lock().clone()
    }

    /// Latest originate sent to `destination`.
    pub fn request_for(&self, destination: &str) -> Option<OriginateRequest> {
        self.originated
            .lock()
            .iter()
            .rev()
            .find(|r| r.destination == destination)
            .cloned()
    }

    pub async fn emit(&self, correlation_id: CorrelationId, kind: EventKind) {
        self.events
            .send(PeerEvent::Call {
                correlation_id,
                kind,
            })
            .await
            .unwrap();
    }

    /// Ring, answer, play and hang up.
    pub async fn complete(&self, correlation_id: CorrelationId) {
        for kind in [
            EventKind::Ringing,
            EventKind::Answered,
            EventKind::PlaybackStarted,
            EventKind::PlaybackFinished,
            normal_clearing(),
        ] {
            self.emit(correlation_id, kind).await;
        }
    }
}

pub fn normal_clearing() -> EventKind {
    EventKind::Hangup {
        cause: 16,
        text: "Normal Clearing".to_string(),
    }
}

#[async_trait]
impl CallControl for MockPeer {
    async fn originate(&self, request: OriginateRequest) -> CallResult<CorrelationId> {
        let correlation_id = request.correlation_id;
        let refused = self.refused.lock().contains(&request.destination);
        self.originated.lock().push(request);
        if refused {
            return Err(CallError::OriginateRejected {
                reason: "invalid destination".to_string(),
                transient: false,
            });
        }
        Ok(correlation_id)
    }

    /// Every hangup is confirmed with a `Hangup` event, like the real peer.
    async fn hangup(&self, correlation_id: CorrelationId) -> CallResult<()> {
        self.hangups.lock().push(correlation_id);
        let _ = self
            .events
            .send(PeerEvent::Call {
                correlation_id,
                kind: normal_clearing(),
            })
            .await;
        Ok(())
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            connected: true,
            ..Default::default()
        }
    }
}

pub struct Harness {
    pub engine: CallEngine,
    pub peer: Arc<MockPeer>,
    pub events: mpsc::Sender<PeerEvent>,
    pub history: CallHistory,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let (events, peer_events) = mpsc::channel(256);
        let peer = Arc::new(MockPeer::new(events.clone()));
        let history = CallHistory::in_memory();
        let engine = CallEngine::spawn(config, peer.clone(), history.clone(), peer_events);
        Self {
            engine,
            peer,
            events,
            history,
        }
    }

    pub async fn stats(&self) -> EngineStats {
        self.engine.stats().await.unwrap()
    }

    pub async fn connect(&self) {
        self.events.send(PeerEvent::Connected).await.unwrap();
        eventually(|| async move { self.stats().await.connected }).await;
    }

    pub async fn disconnect(&self) {
        self.events.send(PeerEvent::ConnectionLost).await.unwrap();
        eventually(|| async move { !self.stats().await.connected }).await;
    }

    pub async fn wait_originated(&self, count: usize) {
        eventually(|| async move { self.peer.originated_count() >= count }).await;
    }
}

pub fn config(limit: usize) -> EngineConfig {
    EngineConfig {
        concurrency_limit: limit,
        ..Default::default()
    }
}

/// Poll `check` until it holds, panicking after `WAIT_LIMIT`.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
