//! In-memory replay and flood protection for webhook deliveries.
//!
//! Both guards are single-process and reset on restart: they provide
//! best-effort protection only and make no durability claim. Shared maps
//! need synchronization in Rust, so each guard holds a std `Mutex`; the
//! critical sections are a handful of map operations.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default TTL for remembered webhook ids.
const DEFAULT_REPLAY_TTL: Duration = Duration::from_secs(300);
/// Default capacity bound for the replay set.
const DEFAULT_REPLAY_CAPACITY: usize = 10_000;

struct ReplayInner {
    seen: HashMap<String, Instant>,
    /// Insertion order for oldest-first eviction
    order: VecDeque<String>,
}

/// Remembers recently seen webhook ids to drop duplicate deliveries.
///
/// Entries expire after a fixed TTL; when the capacity bound is hit, the
/// oldest entry is evicted first.
pub struct ReplayGuard {
    inner: Mutex<ReplayInner>,
    ttl: Duration,
    capacity: usize,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_REPLAY_TTL, DEFAULT_REPLAY_CAPACITY)
    }

    pub fn with_config(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ReplayInner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl,
            capacity,
        }
    }

    /// Returns `true` if `id` has not been seen within the TTL, remembering
    /// it; `false` means the delivery is a replay and should be dropped.
    ///
    /// A poisoned lock admits the delivery: a missed duplicate-detection is
    /// acceptable here, a dropped legitimate delivery is not.
    pub fn check_and_remember(&self, id: &str) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return true;
        };
        let now = Instant::now();

        // Purge expired ids from the front of the insertion order. A
        // re-remembered id can leave a stale order entry behind; those are
        // dropped like expired ones.
        while let Some(front_id) = inner.order.front().cloned() {
            let expired = match inner.seen.get(&front_id) {
                Some(seen_at) => now.duration_since(*seen_at) >= self.ttl,
                None => true,
            };
            if !expired {
                break;
            }
            inner.order.pop_front();
            inner.seen.remove(&front_id);
        }

        if let Some(seen_at) = inner.seen.get(id) {
            if now.duration_since(*seen_at) < self.ttl {
                return false;
            }
        }

        // Evict oldest when at capacity
        while inner.seen.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.seen.remove(&oldest);
                }
                None => break,
            }
        }

        inner.seen.insert(id.to_string(), now);
        inner.order.push_back(id.to_string());
        true
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Default flood window.
const DEFAULT_FLOOD_WINDOW: Duration = Duration::from_secs(60);
/// Default events allowed per window.
const DEFAULT_FLOOD_MAX_EVENTS: usize = 120;

/// Sliding-window flood limiter keyed by an arbitrary identifier.
///
/// Not a substitute for the tenant rate limiter: this is a coarse,
/// in-memory safety valve in front of webhook processing.
pub struct FloodLimiter {
    events: Mutex<HashMap<String, VecDeque<Instant>>>,
    window: Duration,
    max_events: usize,
}

impl FloodLimiter {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_FLOOD_WINDOW, DEFAULT_FLOOD_MAX_EVENTS)
    }

    pub fn with_config(window: Duration, max_events: usize) -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            window,
            max_events,
        }
    }

    /// Record one event for `key`; returns `false` when the window is full.
    pub fn allow(&self, key: &str) -> bool {
        let Ok(mut events) = self.events.lock() else {
            return true;
        };
        let now = Instant::now();
        let window = self.window;

        let timestamps = events.entry(key.to_string()).or_default();
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.max_events {
            return false;
        }

        timestamps.push_back(now);
        true
    }
}

impl Default for FloodLimiter {
    fn default() -> Self {
        Self::new()
    }
}
