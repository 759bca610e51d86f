//! Leaky-bucket rate limiting with pluggable bucket storage.
//!
//! A [`LeakyBucket`] drains at a constant rate and rejects pours that would
//! overflow its capacity. [`Memory`] keeps buckets per key and garbage
//! collects drained ones opportunistically.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Buckets held by [`Memory`] before an insert triggers garbage collection.
pub const GC_SIZE: usize = 100;

/// Minimum interval between two garbage collection passes.
pub const GC_PERIOD: Duration = Duration::from_secs(60);

/// Clock seam for deterministic tests.
pub(crate) type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// A time-based rate limiter.
///
/// The fill level drains at one unit per `leak_interval`; pouring `n` units
/// succeeds iff the drained fill plus `n` fits within `size`.
#[derive(Clone)]
pub struct LeakyBucket {
    pub size: u64,
    pub fill: f64,
    pub leak_interval: Duration,
    pub last_update: SystemTime,
    // Crate-internal seam: update_fill trusts this clock unconditionally.
    // `new` and `LeakyBucketSer::deserialise` install the wall clock.
    pub(crate) now: Clock,
}

impl fmt::Debug for LeakyBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("size", &self.size)
            .field("fill", &self.fill)
            .field("leak_interval", &self.leak_interval)
            .field("last_update", &self.last_update)
            .finish_non_exhaustive()
    }
}

impl LeakyBucket {
    /// Creates an empty bucket holding at most `size` units, draining one
    /// unit per `leak_interval`.
    pub fn new(size: u64, leak_interval: Duration) -> Self {
        LeakyBucket {
            size,
            fill: 0.0,
            leak_interval,
            last_update: SystemTime::now(),
            now: Arc::new(SystemTime::now),
        }
    }

    fn update_fill(&mut self) {
        let now = (self.now)();
        if self.fill > 0.0 {
            if let Ok(elapsed) = now.duration_since(self.last_update) {
                self.fill -= elapsed.as_secs_f64() / self.leak_interval.as_secs_f64();
                if self.fill < 0.0 {
                    self.fill = 0.0;
                }
            }
        }
        self.last_update = now;
    }

    /// Leaks based on elapsed time, then pours `amount` units. Returns false
    /// without changing the fill when the pour would overflow.
    pub fn pour(&mut self, amount: u64) -> bool {
        self.update_fill();
        let new_fill = self.fill + amount as f64;
        if new_fill > self.size as f64 {
            return false;
        }
        self.fill = new_fill;
        true
    }

    /// Time elapsed since the fill level was last updated.
    pub fn time_since_last_update(&self) -> Duration {
        (self.now)()
            .duration_since(self.last_update)
            .unwrap_or(Duration::ZERO)
    }

    /// How long until the bucket is empty, after applying the pending leak.
    pub fn time_to_drain(&mut self) -> Duration {
        self.update_fill();
        Duration::from_secs_f64(self.fill * self.leak_interval.as_secs_f64())
    }

    /// The instant at which the bucket will be empty; `last_update` for an
    /// already-empty bucket.
    pub fn drained_at(&mut self) -> SystemTime {
        let to_drain = self.time_to_drain();
        self.last_update + to_drain
    }

    /// Converts to the plain persistable record.
    pub fn serialise(&self) -> LeakyBucketSer {
        LeakyBucketSer {
            size: self.size,
            fill: self.fill,
            leak_interval: self.leak_interval,
            last_update: self.last_update,
        }
    }
}

/// Plain persistable form of a [`LeakyBucket`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketSer {
    pub size: u64,
    pub fill: f64,
    pub leak_interval: Duration,
    pub last_update: SystemTime,
}

impl LeakyBucketSer {
    /// Restores a bucket; its clock defaults to the real wall clock.
    pub fn deserialise(&self) -> LeakyBucket {
        LeakyBucket {
            size: self.size,
            fill: self.fill,
            leak_interval: self.leak_interval,
            last_update: self.last_update,
            now: Arc::new(SystemTime::now),
        }
    }
}

/// Keyed bucket storage.
pub trait Storage {
    fn get_bucket_for(&self, key: &str) -> Result<LeakyBucket>;
    fn set_bucket_for(&self, key: &str, bucket: LeakyBucket) -> Result<()>;
}

struct MemoryState {
    buckets: HashMap<String, LeakyBucket>,
    last_collected: SystemTime,
}

/// In-memory [`Storage`] with opportunistic garbage collection.
pub struct Memory {
    // Get and insert are not hot paths, so std::sync::Mutex is good enough.
    state: Mutex<MemoryState>,
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            state: Mutex::new(MemoryState {
                buckets: HashMap::new(),
                last_collected: SystemTime::now(),
            }),
        }
    }

    /// Removes every bucket that has fully drained. Runs at most once per
    /// [`GC_PERIOD`]; extra calls in between are no-ops.
    pub fn garbage_collect(&self) {
        let mut state = self.state.lock().unwrap();

        let now = SystemTime::now();
        match now.duration_since(state.last_collected) {
            Ok(elapsed) if elapsed >= GC_PERIOD => {}
            _ => return,
        }

        state.last_collected = now;
        state.buckets.retain(|_, bucket| bucket.drained_at() > now);
    }

    #[cfg(test)]
    fn set_last_collected(&self, at: SystemTime) {
        self.state.lock().unwrap().last_collected = at;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().buckets.len()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new()
    }
}

impl Storage for Memory {
    fn get_bucket_for(&self, key: &str) -> Result<LeakyBucket> {
        let state = self.state.lock().unwrap();
        state
            .buckets
            .get(key)
            .cloned()
            .ok_or_else(|| Error::BucketNotFound {
                key: key.to_string(),
            })
    }

    fn set_bucket_for(&self, key: &str, bucket: LeakyBucket) -> Result<()> {
        let over_threshold = {
            let mut state = self.state.lock().unwrap();
            state.buckets.insert(key.to_string(), bucket);
            state.buckets.len() > GC_SIZE
        };

        if over_threshold {
            self.garbage_collect();
        }

        Ok(())
    }
}
