use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Time-bounded set of AuthnRequest IDs this SP issued.
///
/// Each ID can be consumed once. Concurrent callbacks race on `DashMap`'s
/// per-shard locks, so exactly one of them wins a given ID.
#[derive(Debug, Default)]
pub struct RequestCache {
    entries: DashMap<String, Instant>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `id` until `ttl` has passed.
    ///
    /// Returns `false` without storing anything when `capacity` IDs are
    /// still outstanding after expired ones are purged. Concurrent inserts
    /// can overshoot the bound by the number of racing callers.
    pub fn insert(&self, id: impl Into<String>, ttl: Duration, capacity: usize) -> bool {
        if self.entries.len() >= capacity {
            self.purge_expired();
            if self.entries.len() >= capacity {
                return false;
            }
        }
        let Some(expires_at) = Instant::now().checked_add(ttl) else {
            return false;
        };
        self.entries.insert(id.into(), expires_at);
        true
    }

    /// Remove `id`, returning whether it was issued and has not expired.
    pub fn take(&self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some((_, expires_at)) => expires_at > Instant::now(),
            None => false,
        }
    }

    /// Drop expired IDs, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
