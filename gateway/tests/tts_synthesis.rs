//! HTTP synthesizer and audio cache against a wiremock engine.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use outcall_gateway::core::model::MessageSpec;
use outcall_gateway::core::tts::{
    HttpSynthesizer, Synthesizer, TtsCache, TtsCacheConfig, cache_key,
};
use outcall_gateway::errors::CallError;
use outcall_gateway::utils::Secret;

const AUDIO: &[u8] = b"RIFF\x24\x00\x00\x00WAVEfmt fake audio";

fn synthesizer(server: &MockServer) -> HttpSynthesizer {
    HttpSynthesizer::new(
        format!("{}/api/tts", server.uri()),
        Some(Secret::new("tts-token")),
        Duration::from_secs(5),
    )
    .unwrap()
}

async fn cache(dir: &TempDir, synthesizer: HttpSynthesizer) -> TtsCache {
    TtsCache::open(
        TtsCacheConfig {
            dir: dir.path().to_path_buf(),
            max_bytes: 1024 * 1024,
            default_voice: "en_US-amy-medium".to_string(),
            default_engine: "piper".to_string(),
        },
        Arc::new(synthesizer),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_synthesize_posts_message_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/tts"))
        .and(header("Authorization", "Bearer tts-token"))
        .and(body_json(serde_json::json!({
            "message": "Front door is open",
            "voice": "amy",
            "engine": "piper",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(AUDIO))
        .expect(1)
        .mount(&server)
        .await;

    let audio = synthesizer(&server)
        .synthesize("Front door is open", "amy", "piper")
        .await
        .unwrap();
    assert_eq!(&audio[..], AUDIO);
}

#[tokio::test]
async fn test_engine_errors_become_synthesis_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .mount(&server)
        .await;

    let err = synthesizer(&server)
        .synthesize("hello", "amy", "piper")
        .await
        .unwrap_err();
    match err {
        CallError::SynthesisFailed(detail) => assert!(detail.contains("model not loaded")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_audio_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let err = synthesizer(&server)
        .synthesize("hello", "amy", "piper")
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::SynthesisFailed(_)));
}

#[tokio::test]
async fn test_cache_synthesizes_each_message_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(AUDIO))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, synthesizer(&server)).await;
    let message = MessageSpec::text("Dinner   is ready");

    let first = cache.playback(&message).await.unwrap();
    let second = cache
        .playback(&MessageSpec::text("  Dinner is ready "))
        .await
        .unwrap();
    assert_eq!(first.name(), second.name());

    let key = cache_key("Dinner is ready", "en_US-amy-medium", "piper");
    assert!(cache.contains(&key));
    let lease = first.lease().unwrap();
    assert_eq!(lease.key(), key);
    assert_eq!(std::fs::read(lease.path()).unwrap(), AUDIO);
    assert!(!first.name().ends_with(".wav"));
}

#[tokio::test]
async fn test_failed_synthesis_leaves_no_entry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, synthesizer(&server)).await;

    let err = cache
        .playback(&MessageSpec::text("Garage left open"))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::SynthesisFailed(_)));
    assert_eq!(cache.stats().entries, 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
