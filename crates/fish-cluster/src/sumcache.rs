//! TTL dedup cache keyed by a [`Message`](crate::message::Message)'s
//! `Sum` (`SPEC_FULL.md` §5.5). Grounded on the same `Instant`-keyed
//! expiry idiom as `fish_engine::capacity::RemoteCapacityCache`; the
//! hub keeps one hub-wide instance plus one per connected peer.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// How long a sum is remembered before it becomes eligible again.
pub const SUM_CACHE_TTL: Duration = Duration::from_secs(120);

/// How often a background sweep should drop expired entries.
pub const SUM_CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Short-TTL map of recently seen message checksums, used both
/// cluster-wide (broadcast only once) and per-peer (re-broadcast to a
/// peer only if it hasn't already seen the sum).
#[derive(Default)]
pub struct SumCache {
    seen: DashMap<u32, Instant>,
}

impl SumCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `sum` if not already present and unexpired. Returns
    /// `true` iff this was a new insertion (`SPEC_FULL.md` §8:
    /// "`Put(x)` is `true` exactly once within its TTL").
    pub fn put(&self, sum: u32) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.seen.get(&sum) {
            if now.duration_since(*seen_at) < SUM_CACHE_TTL {
                return false;
            }
        }
        self.seen.insert(sum, now);
        true
    }

    /// Whether `sum` is currently known (without inserting it).
    pub fn contains(&self, sum: u32) -> bool {
        match self.seen.get(&sum) {
            Some(seen_at) => seen_at.elapsed() < SUM_CACHE_TTL,
            None => false,
        }
    }

    /// Forget `sum`, making the next `put` for it return `true` again.
    /// Called after a processing error so the message is eligible for
    /// retry (`SPEC_FULL.md` §5.5/§8).
    pub fn delete(&self, sum: u32) {
        self.seen.remove(&sum);
    }

    /// Drop every entry past its TTL. Intended to run on a
    /// [`SUM_CACHE_CLEANUP_INTERVAL`] tick.
    pub fn sweep_expired(&self) {
        self.seen.retain(|_, seen_at| seen_at.elapsed() < SUM_CACHE_TTL);
    }

    /// Number of currently tracked sums, for metrics/logging.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Spawn the periodic cleanup sweep for a shared cache. Returns the
/// `JoinHandle` so callers can abort it on shutdown.
pub fn spawn_cleanup(cache: std::sync::Arc<SumCache>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SUM_CACHE_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            cache.sweep_expired();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_true_exactly_once_within_ttl() {
        let cache = SumCache::new();
        assert!(cache.put(42));
        assert!(!cache.put(42));
    }

    #[test]
    fn delete_makes_put_true_again() {
        let cache = SumCache::new();
        assert!(cache.put(42));
        cache.delete(42);
        assert!(cache.put(42));
    }

    #[test]
    fn distinct_sums_are_independent() {
        let cache = SumCache::new();
        assert!(cache.put(1));
        assert!(cache.put(2));
        assert!(!cache.put(1));
    }

    #[test]
    fn sweep_expired_removes_old_entries_only() {
        let cache = SumCache::new();
        cache.seen.insert(1, Instant::now() - SUM_CACHE_TTL - Duration::from_secs(1));
        cache.seen.insert(2, Instant::now());
        cache.sweep_expired();
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
    }
}
