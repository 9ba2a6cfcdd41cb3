//! Content-addressed audio cache.
//!
//! Entries are WAV files named after the xxh3-128 hash of the normalized text,
//! voice and engine. Synthesis for a given key runs at most once at a time:
//! concurrent misses on the same key wait on a per-key lock and then hit.
//! Eviction is least-recently-used over the configured size bound and never
//! touches an entry with outstanding [`AudioLease`]s.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_128;

use super::{Playback, Synthesizer};
use crate::core::model::MessageSpec;
use crate::errors::{CallError, CallResult};

const AUDIO_EXTENSION: &str = "wav";

#[derive(Debug, Clone)]
pub struct TtsCacheConfig {
    pub dir: PathBuf,
    /// Aggregate size bound in bytes
    pub max_bytes: u64,
    pub default_voice: String,
    pub default_engine: String,
}

/// Trim and collapse whitespace runs to a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn cache_key(text: &str, voice: &str, engine: &str) -> String {
    let mut s = String::new();
    s.push_str(engine);
    s.push('|');
    s.push_str(voice);
    s.push('|');
    s.push_str(&normalize_text(text));
    let hash = xxh3_128(s.as_bytes());
    format!("{hash:032x}")
}

#[derive(Debug)]
struct CacheEntry {
    size: u64,
    last_used: u64,
    leases: usize,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    clock: u64,
}

impl CacheIndex {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

#[derive(Debug)]
struct CacheShared {
    dir: PathBuf,
    max_bytes: u64,
    index: Mutex<CacheIndex>,
}

impl CacheShared {
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{AUDIO_EXTENSION}"))
    }

    fn lease(self: &Arc<Self>, key: &str) -> Option<AudioLease> {
        let mut index = self.index.lock();
        let now = index.tick();
        let entry = index.entries.get_mut(key)?;
        entry.leases += 1;
        entry.last_used = now;
        Some(AudioLease {
            key: key.to_string(),
            path: self.path_for(key),
            shared: self.clone(),
        })
    }

    fn release(&self, key: &str) {
        let mut index = self.index.lock();
        if let Some(entry) = index.entries.get_mut(key) {
            entry.leases = entry.leases.saturating_sub(1);
        }
        self.evict_locked(&mut index);
    }

    /// Drop unleased entries, oldest first, until the bound holds again.
    fn evict_locked(&self, index: &mut CacheIndex) {
        if index.total_bytes <= self.max_bytes {
            return;
        }

        let mut candidates: Vec<(u64, String)> = index
            .entries
            .iter()
            .filter(|(_, entry)| entry.leases == 0)
            .map(|(key, entry)| (entry.last_used, key.clone()))
            .collect();
        candidates.sort();

        for (_, key) in candidates {
            if index.total_bytes <= self.max_bytes {
                break;
            }
            if let Some(entry) = index.entries.remove(&key) {
                index.total_bytes = index.total_bytes.saturating_sub(entry.size);
                // Removed under the index lock so a concurrent miss cannot
                // rewrite the file before it is gone
                if let Err(e) = std::fs::remove_file(self.path_for(&key)) {
                    warn!("Failed to remove evicted cache entry {}: {}", key, e);
                }
                debug!(key = %key, "Evicted cache entry");
            }
        }

        if index.total_bytes > self.max_bytes {
            debug!(
                total_bytes = index.total_bytes,
                max_bytes = self.max_bytes,
                "Cache over bound, remaining entries are leased"
            );
        }
    }
}

/// Reference to a cached audio file. The entry is pinned while any lease
/// (or clone of one) is alive.
#[derive(Debug)]
pub struct AudioLease {
    key: String,
    path: PathBuf,
    shared: Arc<CacheShared>,
}

impl AudioLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sound name for the dial plan: the file path without extension.
    pub fn playback_name(&self) -> String {
        self.path.with_extension("").to_string_lossy().into_owned()
    }
}

impl Clone for AudioLease {
    fn clone(&self) -> Self {
        let mut index = self.shared.index.lock();
        if let Some(entry) = index.entries.get_mut(&self.key) {
            entry.leases += 1;
        }
        Self {
            key: self.key.clone(),
            path: self.path.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Drop for AudioLease {
    fn drop(&mut self) {
        self.shared.release(&self.key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub leased: usize,
}

pub struct TtsCache {
    shared: Arc<CacheShared>,
    synthesizer: Arc<dyn Synthesizer>,
    in_progress: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    default_voice: String,
    default_engine: String,
}

impl TtsCache {
    /// Open the cache directory, indexing the files already present.
    pub async fn open(config: TtsCacheConfig, synthesizer: Arc<dyn Synthesizer>) -> CallResult<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;

        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(&config.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(AUDIO_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if key.len() != 32 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }
            let metadata = item.metadata().await?;
            found.push((metadata.modified().ok(), key, metadata.len()));
        }
        // Oldest files become the first eviction candidates
        found.sort();

        let mut index = CacheIndex::default();
        for (_, key, size) in found {
            let last_used = index.tick();
            index.total_bytes += size;
            index.entries.insert(
                key,
                CacheEntry {
                    size,
                    last_used,
                    leases: 0,
                },
            );
        }
        info!(
            entries = index.entries.len(),
            total_bytes = index.total_bytes,
            "Opened TTS cache at {}",
            config.dir.display()
        );

        let shared = Arc::new(CacheShared {
            dir: config.dir,
            max_bytes: config.max_bytes,
            index: Mutex::new(index),
        });
        {
            let mut index = shared.index.lock();
            shared.evict_locked(&mut index);
        }

        Ok(Self {
            shared,
            synthesizer,
            in_progress: DashMap::new(),
            default_voice: config.default_voice,
            default_engine: config.default_engine,
        })
    }

    /// Audio for `(text, voice, engine)`: served from the cache when present,
    /// otherwise synthesized once and stored.
    pub async fn resolve(&self, text: &str, voice: &str, engine: &str) -> CallResult<AudioLease> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Err(CallError::InvalidRequest("message text is empty".to_string()));
        }
        let key = cache_key(&normalized, voice, engine);

        if let Some(lease) = self.shared.lease(&key) {
            debug!(key = %key, "TTS cache hit");
            return Ok(lease);
        }

        let lock = self
            .in_progress
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let result = match self.shared.lease(&key) {
            Some(lease) => Ok(lease),
            None => self.synthesize_and_store(&key, &normalized, voice, engine).await,
        };

        drop(guard);
        self.in_progress.remove_if(&key, |_, existing| Arc::ptr_eq(existing, &lock));
        result
    }

    async fn synthesize_and_store(
        &self,
        key: &str,
        text: &str,
        voice: &str,
        engine: &str,
    ) -> CallResult<AudioLease> {
        debug!(key = %key, voice, engine, "TTS cache miss, synthesizing");
        let audio = self.synthesizer.synthesize(text, voice, engine).await?;
        if audio.is_empty() {
            return Err(CallError::SynthesisFailed("engine returned no audio".to_string()));
        }

        let path = self.shared.path_for(key);
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, &audio).await?;
        tokio::fs::rename(&partial, &path).await?;

        let mut index = self.shared.index.lock();
        let now = index.tick();
        let size = audio.len() as u64;
        index.total_bytes += size;
        index.entries.insert(
            key.to_string(),
            CacheEntry {
                size,
                last_used: now,
                leases: 1,
            },
        );
        let lease = AudioLease {
            key: key.to_string(),
            path,
            shared: self.shared.clone(),
        };
        self.shared.evict_locked(&mut index);
        Ok(lease)
    }

    /// Turn a message into something the dial plan can play.
    pub async fn playback(&self, message: &MessageSpec) -> CallResult<Playback> {
        match message {
            MessageSpec::Recording { file } => {
                validate_recording_name(file)?;
                Ok(Playback::recording(file.clone()))
            }
            MessageSpec::Text {
                text,
                voice,
                engine,
            } => {
                let voice = voice.as_deref().unwrap_or(&self.default_voice);
                let engine = engine.as_deref().unwrap_or(&self.default_engine);
                let lease = self.resolve(text, voice, engine).await?;
                Ok(Playback::cached(lease))
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared.index.lock().entries.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.shared.index.lock();
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.total_bytes,
            leased: index.entries.values().filter(|e| e.leases > 0).count(),
        }
    }
}

fn validate_recording_name(file: &str) -> CallResult<()> {
    if file.trim().is_empty() {
        return Err(CallError::InvalidRequest("recording file is empty".to_string()));
    }
    if file.contains("..") || file.chars().any(|c| c.is_control()) {
        return Err(CallError::InvalidRequest(format!(
            "invalid recording file name: {file:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;

    /// Returns `size` bytes per call and counts invocations.
    struct CountingSynth {
        calls: AtomicUsize,
        size: usize,
        delay: Duration,
    }

    impl CountingSynth {
        fn new(size: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                size,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Synthesizer for CountingSynth {
        async fn synthesize(&self, _text: &str, _voice: &str, _engine: &str) -> CallResult<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Bytes::from(vec![0u8; self.size]))
        }
    }

    struct FailingSynth;

    #[async_trait]
    impl Synthesizer for FailingSynth {
        async fn synthesize(&self, _text: &str, _voice: &str, _engine: &str) -> CallResult<Bytes> {
            Err(CallError::SynthesisFailed("engine down".to_string()))
        }
    }

    fn config(dir: &TempDir, max_bytes: u64) -> TtsCacheConfig {
        TtsCacheConfig {
            dir: dir.path().to_path_buf(),
            max_bytes,
            default_voice: "amy".to_string(),
            default_engine: "piper".to_string(),
        }
    }

    #[test]
    fn test_key_ignores_whitespace_differences() {
        assert_eq!(
            cache_key("  Dinner   is\tready ", "amy", "piper"),
            cache_key("Dinner is ready", "amy", "piper")
        );
        assert_ne!(
            cache_key("Dinner is ready", "amy", "piper"),
            cache_key("Dinner is ready", "joe", "piper")
        );
        assert_ne!(
            cache_key("Dinner is ready", "amy", "piper"),
            cache_key("Dinner is ready", "amy", "espeak")
        );
        assert_eq!(cache_key("x", "a", "b").len(), 32);
    }

    #[tokio::test]
    async fn test_resolve_synthesizes_once_per_key() {
        let dir = TempDir::new().unwrap();
        let synth = CountingSynth::new(100);
        let cache = TtsCache::open(config(&dir, 10_000), synth.clone()).await.unwrap();

        let first = cache.resolve("Dinner is ready", "amy", "piper").await.unwrap();
        let second = cache.resolve("Dinner  is ready", "amy", "piper").await.unwrap();

        assert_eq!(first.key(), second.key());
        assert_eq!(first.path(), second.path());
        assert!(first.path().exists());
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_synthesis() {
        let dir = TempDir::new().unwrap();
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
            size: 64,
            delay: Duration::from_millis(50),
        });
        let cache = Arc::new(TtsCache::open(config(&dir, 10_000), synth.clone()).await.unwrap());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.resolve("Front door open", "amy", "piper").await.map(|l| l.key().to_string())
            }));
        }
        let mut keys = Vec::new();
        for task in tasks {
            keys.push(task.await.unwrap().unwrap());
        }

        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eviction_skips_leased_entries() {
        let dir = TempDir::new().unwrap();
        let synth = CountingSynth::new(100);
        // Room for two entries
        let cache = TtsCache::open(config(&dir, 250), synth.clone()).await.unwrap();

        let pinned = cache.resolve("one", "amy", "piper").await.unwrap();
        let second = cache.resolve("two", "amy", "piper").await.unwrap();
        let second_key = second.key().to_string();
        drop(second);

        let third = cache.resolve("three", "amy", "piper").await.unwrap();

        assert!(cache.contains(pinned.key()));
        assert!(pinned.path().exists());
        assert!(!cache.contains(&second_key));
        assert!(cache.contains(third.key()));
        assert_eq!(cache.stats().total_bytes, 200);
    }

    #[tokio::test]
    async fn test_leases_hold_entries_over_bound_until_released() {
        let dir = TempDir::new().unwrap();
        let synth = CountingSynth::new(100);
        let cache = TtsCache::open(config(&dir, 150), synth.clone()).await.unwrap();

        let a = cache.resolve("one", "amy", "piper").await.unwrap();
        let b = cache.resolve("two", "amy", "piper").await.unwrap();
        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.stats().leased, 2);

        drop(a);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert!(cache.contains(b.key()));
    }

    #[tokio::test]
    async fn test_index_rebuilt_from_directory() {
        let dir = TempDir::new().unwrap();
        let key = {
            let synth = CountingSynth::new(10);
            let cache = TtsCache::open(config(&dir, 10_000), synth).await.unwrap();
            let lease = cache.resolve("Garage left open", "amy", "piper").await.unwrap();
            lease.key().to_string()
        };

        let synth = CountingSynth::new(10);
        let cache = TtsCache::open(config(&dir, 10_000), synth.clone()).await.unwrap();
        assert!(cache.contains(&key));

        let lease = cache.resolve("Garage left open", "amy", "piper").await.unwrap();
        assert_eq!(lease.key(), key);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_synthesis_failure_leaves_no_entry() {
        let dir = TempDir::new().unwrap();
        let cache = TtsCache::open(config(&dir, 10_000), Arc::new(FailingSynth)).await.unwrap();

        let err = cache.resolve("hello", "amy", "piper").await.unwrap_err();
        assert!(matches!(err, CallError::SynthesisFailed(_)));
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_playback_for_messages() {
        let dir = TempDir::new().unwrap();
        let cache = TtsCache::open(config(&dir, 10_000), CountingSynth::new(10)).await.unwrap();

        let recording = cache.playback(&MessageSpec::recording("custom/doorbell")).await.unwrap();
        assert_eq!(recording.name(), "custom/doorbell");
        assert!(recording.lease().is_none());

        let text = cache.playback(&MessageSpec::text("hello")).await.unwrap();
        let lease = text.lease().unwrap();
        assert_eq!(lease.key(), cache_key("hello", "amy", "piper"));
        assert!(!text.name().ends_with(".wav"));

        let bad = cache.playback(&MessageSpec::recording("../../etc/passwd")).await;
        assert!(matches!(bad, Err(CallError::InvalidRequest(_))));
    }
}
