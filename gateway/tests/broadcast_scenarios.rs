//! Broadcast fan-out and aggregation against a scripted call-control peer.

mod mock_peer;

use std::sync::Arc;

use mock_peer::{Harness, config, eventually};
use outcall_gateway::core::broadcast::{
    AggregateStatus, BroadcastDispatcher, BroadcastRecord, BroadcastRequest, BroadcastStatus,
};
use outcall_gateway::core::directory::Directory;
use outcall_gateway::core::history::BroadcastHistory;
use outcall_gateway::core::lifecycle::CallState;
use outcall_gateway::core::model::{BroadcastId, ContactGroup, MessageSpec};
use outcall_gateway::core::tts::{TtsCache, TtsCacheConfig, UnavailableSynthesizer};
use outcall_gateway::errors::CallError;
use tempfile::TempDir;

async fn dispatcher(h: &Harness, dir: &TempDir, groups: Vec<ContactGroup>) -> BroadcastDispatcher {
    let cache = TtsCache::open(
        TtsCacheConfig {
            dir: dir.path().to_path_buf(),
            max_bytes: 1024 * 1024,
            default_voice: "amy".to_string(),
            default_engine: "piper".to_string(),
        },
        Arc::new(UnavailableSynthesizer),
    )
    .await
    .unwrap();
    let directory = Directory::new(groups, Vec::new()).unwrap();
    BroadcastDispatcher::new(
        h.engine.clone(),
        Arc::new(cache),
        Arc::new(directory),
        "Home Assistant",
    )
}

fn request(numbers: &[&str]) -> BroadcastRequest {
    BroadcastRequest {
        name: "dinner".to_string(),
        numbers: numbers.iter().map(|n| n.to_string()).collect(),
        group: None,
        message: MessageSpec::recording("custom/dinner"),
        caller_id: None,
        concurrency: None,
    }
}

async fn finished(dispatcher: &BroadcastDispatcher, id: BroadcastId) -> BroadcastRecord {
    eventually(|| async move {
        dispatcher
            .get(id)
            .is_some_and(|r| r.status == BroadcastStatus::Done)
    })
    .await;
    dispatcher.get(id).unwrap()
}

#[tokio::test]
async fn test_one_refused_destination_gives_partial_result() {
    let harness = Harness::new(config(5));
    let h = &harness;
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(h, &dir, Vec::new()).await;
    h.peer.refuse("+15550002");
    h.connect().await;

    let record = dispatcher
        .dispatch(request(&["+15550001", "+15550002", "+15550003"]))
        .unwrap();
    assert_eq!(record.total, 3);
    assert_eq!(record.status, BroadcastStatus::Initiated);

    h.wait_originated(3).await;
    for destination in ["+15550001", "+15550003"] {
        let sent = h.peer.request_for(destination).unwrap();
        assert_eq!(sent.caller_id, "Home Assistant");
        assert_eq!(sent.playback, "custom/dinner");
        h.peer.complete(sent.correlation_id).await;
    }

    let done = finished(&dispatcher, record.broadcast_id).await;
    assert_eq!(done.aggregate, Some(AggregateStatus::Partial));
    assert_eq!(done.completed, 2);
    assert_eq!(done.failed, 1);
    assert_eq!(done.in_progress, 0);
    assert_eq!(done.job_ids.len(), 3);
    assert!(done.completed_at.is_some());

    let children = h.history.for_broadcast(record.broadcast_id);
    assert_eq!(children.len(), 3);
    let failed: Vec<_> = children
        .iter()
        .filter(|c| c.final_state == CallState::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].destination, "+15550002");
}

#[tokio::test]
async fn test_group_members_share_the_global_limit() {
    let harness = Harness::new(config(2));
    let h = &harness;
    let dir = TempDir::new().unwrap();
    let family = ContactGroup {
        name: "family".to_string(),
        numbers: vec![
            "+15550001".to_string(),
            "+15550002".to_string(),
            "+15550001".to_string(),
        ],
        caller_id: Some("Kitchen".to_string()),
    };
    let dispatcher = dispatcher(h, &dir, vec![family]).await;
    h.connect().await;

    let mut broadcast = request(&["+15550009"]);
    broadcast.group = Some("family".to_string());
    let record = dispatcher.dispatch(broadcast).unwrap();
    // Explicit numbers first, then members; duplicates stay distinct jobs
    assert_eq!(record.total, 4);

    for completed in 0..4 {
        h.wait_originated(completed + 1).await;
        assert!(h.stats().await.in_flight <= 2);
        let sent = h.peer.originated()[completed].clone();
        assert_eq!(sent.caller_id, "Kitchen");
        h.peer.complete(sent.correlation_id).await;
    }

    let done = finished(&dispatcher, record.broadcast_id).await;
    assert_eq!(done.aggregate, Some(AggregateStatus::Success));
    assert_eq!(done.completed, 4);
    let first_batch = &h.peer.originated()[..2];
    assert!(first_batch.iter().any(|r| r.destination == "+15550009"));
}

#[tokio::test]
async fn test_text_message_without_synthesis_fails_every_child() {
    let harness = Harness::new(config(2));
    let h = &harness;
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(h, &dir, Vec::new()).await;
    h.connect().await;

    let mut broadcast = request(&["+15550001", "+15550002"]);
    broadcast.message = MessageSpec::text("The laundry is done");
    let record = dispatcher.dispatch(broadcast).unwrap();

    let done = finished(&dispatcher, record.broadcast_id).await;
    assert_eq!(done.aggregate, Some(AggregateStatus::Failed));
    assert_eq!(done.failed, 2);
    assert_eq!(h.peer.originated_count(), 0);
}

#[tokio::test]
async fn test_finished_broadcast_moves_to_journal() {
    let harness = Harness::new(config(2));
    let h = &harness;
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("broadcasts.jsonl");
    let history = BroadcastHistory::open(&journal).await.unwrap();
    let dispatcher = dispatcher(h, &dir, Vec::new())
        .await
        .with_history(history.clone());
    h.connect().await;

    let record = dispatcher
        .dispatch(request(&["+15550001", "+15550002"]))
        .unwrap();
    assert_eq!(dispatcher.active(), 1);

    h.wait_originated(2).await;
    for sent in h.peer.originated() {
        h.peer.complete(sent.correlation_id).await;
    }

    let done = finished(&dispatcher, record.broadcast_id).await;
    assert_eq!(done.aggregate, Some(AggregateStatus::Success));
    let live = &dispatcher;
    eventually(|| async move { live.active() == 0 }).await;

    // Still reachable once it left the live registry
    assert_eq!(dispatcher.get(record.broadcast_id), Some(done.clone()));
    let listed = dispatcher.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].broadcast_id, record.broadcast_id);

    history.flush().await;
    let reopened = BroadcastHistory::open(&journal).await.unwrap();
    assert_eq!(reopened.get(record.broadcast_id), Some(done));
}

#[tokio::test]
async fn test_invalid_requests_are_refused_up_front() {
    let harness = Harness::new(config(2));
    let h = &harness;
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(h, &dir, Vec::new()).await;

    let err = dispatcher.dispatch(request(&[])).unwrap_err();
    assert!(matches!(err, CallError::InvalidRequest(_)));

    let err = dispatcher.dispatch(request(&["not a number"])).unwrap_err();
    assert!(matches!(err, CallError::InvalidRequest(_)));

    let mut unknown_group = request(&[]);
    unknown_group.group = Some("neighbours".to_string());
    let err = dispatcher.dispatch(unknown_group).unwrap_err();
    assert!(matches!(err, CallError::UnknownGroup(_)));

    let mut zero = request(&["+15550001"]);
    zero.concurrency = Some(0);
    let err = dispatcher.dispatch(zero).unwrap_err();
    assert!(matches!(err, CallError::InvalidRequest(_)));

    assert!(dispatcher.list().is_empty());
}
