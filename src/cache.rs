// In-memory reply cache keyed by prompt, with per-entry expiry.

use log::debug;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Entry {
    reply: String,
    inserted: Instant,
}

/// Least-recently-used reply cache; entries older than `ttl` are never served.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, Entry>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl ResponseCache {
    /// A zero `capacity` is treated as one.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    // entries stay consistent even if a holder panicked
    fn lock(&self) -> MutexGuard<'_, LruCache<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, prompt: &str) -> Option<String> {
        self.get_at(prompt, Instant::now())
    }

    fn get_at(&self, prompt: &str, now: Instant) -> Option<String> {
        let mut entries = self.lock();
        match entries.get(prompt) {
            Some(entry) if now.duration_since(entry.inserted) < self.ttl => return Some(entry.reply.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.pop(prompt);
        None
    }

    pub fn put(&self, prompt: impl Into<String>, reply: impl Into<String>) {
        self.put_at(prompt.into(), reply.into(), Instant::now());
    }

    fn put_at(&self, prompt: String, reply: String, now: Instant) {
        let mut entries = self.lock();
        if let Some((evicted, _)) = entries.push(prompt.clone(), Entry { reply, inserted: now }) {
            if evicted != prompt {
                debug!("Reply cache full, evicted least recently used entry");
            }
        }
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(Instant::now())
    }

    fn purge_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.inserted) >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
