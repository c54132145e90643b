//! Short-lived verification results, keyed by coarse on-screen position.

use gatewatch_core::FaceObservation;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Grid cell containing a face's box center.
///
/// Faces within the same `bucket x bucket` cell share a key, so a face that
/// barely moves between frames maps to the same cached result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpatialKey {
    pub col: i32,
    pub row: i32,
}

impl SpatialKey {
    pub fn from_center(cx: f32, cy: f32, bucket: u32) -> Self {
        let bucket = bucket.max(1) as f32;
        Self {
            col: (cx / bucket).floor() as i32,
            row: (cy / bucket).floor() as i32,
        }
    }

    pub fn for_observation(obs: &FaceObservation, bucket: u32) -> Self {
        let (cx, cy) = obs.center();
        Self::from_center(cx, cy, bucket)
    }
}

/// Outcome class of a completed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Recognized,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub label: String,
    pub verdict: Verdict,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn new(label: impl Into<String>, verdict: Verdict, ttl: Duration) -> Self {
        Self {
            label: label.into(),
            verdict,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Thread-safe map from [`SpatialKey`] to the latest [`CacheEntry`].
///
/// Expired entries are treated as absent on read and dropped lazily.
#[derive(Default)]
pub struct SpatialResultCache {
    entries: Mutex<HashMap<SpatialKey, CacheEntry>>,
}

impl SpatialResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: SpatialKey) -> Option<CacheEntry> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: SpatialKey, now: Instant) -> Option<CacheEntry> {
        let mut entries = self.lock();
        match entries.get(&key) {
            Some(entry) if entry.is_fresh_at(now) => Some(entry.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Whether a fresh entry exists, without cloning it.
    pub fn contains_fresh_at(&self, key: SpatialKey, now: Instant) -> bool {
        self.lock()
            .get(&key)
            .is_some_and(|entry| entry.is_fresh_at(now))
    }

    /// Insert or replace. Last writer wins.
    pub fn put(&self, key: SpatialKey, entry: CacheEntry) {
        self.lock().insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SpatialKey, CacheEntry>> {
        // The map holds plain data; a panicked writer can't leave it half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
