use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tracing::debug;

use crate::errors::{CallError, CallResult};
use crate::utils::Secret;

/// External text-to-speech engine. Output must be deterministic for identical
/// inputs; the cache relies on it.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str, engine: &str) -> CallResult<Bytes>;
}

/// Synthesizer backed by an HTTP endpoint that returns WAV audio.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    token: Option<Secret>,
}

impl HttpSynthesizer {
    pub fn new(endpoint: impl Into<String>, token: Option<Secret>, timeout: Duration) -> CallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::SynthesisFailed(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }

    fn build_request(&self, text: &str, voice: &str, engine: &str) -> reqwest::RequestBuilder {
        let body = json!({
            "message": text,
            "voice": voice,
            "engine": engine,
        });

        let request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);

        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token.expose())),
            None => request,
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str, engine: &str) -> CallResult<Bytes> {
        debug!(voice, engine, chars = text.len(), "Requesting synthesis");

        let response = self
            .build_request(text, voice, engine)
            .send()
            .await
            .map_err(|e| CallError::SynthesisFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CallError::SynthesisFailed(format!(
                "engine returned {status}: {detail}"
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| CallError::SynthesisFailed(format!("failed to read audio: {e}")))?;
        if audio.is_empty() {
            return Err(CallError::SynthesisFailed("engine returned no audio".to_string()));
        }
        Ok(audio)
    }
}

/// Stand-in used when no synthesis endpoint is configured. Recordings still
/// work; text messages fail with `SynthesisFailed`.
pub struct UnavailableSynthesizer;

#[async_trait]
impl Synthesizer for UnavailableSynthesizer {
    async fn synthesize(&self, _text: &str, _voice: &str, _engine: &str) -> CallResult<Bytes> {
        Err(CallError::SynthesisFailed(
            "no TTS endpoint configured".to_string(),
        ))
    }
}
