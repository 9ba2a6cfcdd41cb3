//! Speech synthesis and the content-addressed audio cache.

mod cache;
mod synthesizer;

pub use cache::{AudioLease, CacheStats, TtsCache, TtsCacheConfig, cache_key, normalize_text};
pub use synthesizer::{HttpSynthesizer, Synthesizer, UnavailableSynthesizer};

/// Sound the dial plan plays once the callee answers.
///
/// For synthesized text the playback holds a lease on the cache entry; the
/// entry cannot be evicted until the owning job reaches a terminal state and
/// drops it.
#[derive(Debug, Clone)]
pub struct Playback {
    name: String,
    lease: Option<AudioLease>,
}

impl Playback {
    /// A recording that already exists on the peer.
    pub fn recording(file: impl Into<String>) -> Self {
        Self {
            name: file.into(),
            lease: None,
        }
    }

    pub fn cached(lease: AudioLease) -> Self {
        Self {
            name: lease.playback_name(),
            lease: Some(lease),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lease(&self) -> Option<&AudioLease> {
        self.lease.as_ref()
    }
}
