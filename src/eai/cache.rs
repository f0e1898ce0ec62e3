//! Process-local shard result cache.
//!
//! Keys are a SHA-256 digest over the lower-cased subtask, the normalised
//! full task, the normalised prompt, the mode tag, and the model name.
//! Entries expire by TTL; a TTL of zero disables the cache entirely.
//! Reads take the shared side of a readers/writer lock, so concurrent
//! shard workers probe without contention.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Collapse whitespace and lowercase, so formatting differences do not
/// fragment the cache.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Compute the composite cache key.
pub fn cache_key(subtask: &str, full_task: &str, prompt: &str, mode: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    for part in &[
        subtask.to_lowercase(),
        normalize(full_task),
        normalize(prompt),
        mode.to_string(),
        model.to_string(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    output: String,
    inserted_at: Instant,
}

/// TTL'd map from composite key to shard output.
pub struct ShardCache {
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ShardCache {
    /// `ttl == None` disables the cache: every probe misses and puts are
    /// dropped.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a fresh entry.
    pub fn get(&self, key: &str) -> Option<String> {
        let ttl = self.ttl?;
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() <= ttl {
            Some(entry.output.clone())
        } else {
            None
        }
    }

    /// Store a successful shard output.
    pub fn put(&self, key: String, output: String) {
        if self.ttl.is_none() {
            return;
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key,
                CacheEntry {
                    output,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    /// Drop expired entries. Callers may invoke this opportunistically;
    /// correctness never depends on it.
    pub fn evict_expired(&self) {
        let ttl = match self.ttl {
            Some(ttl) => ttl,
            None => return,
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}
