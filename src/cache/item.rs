//! Cache Item Module
//!
//! Defines a single table entry with idle lifespan and access bookkeeping.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Callback invoked with an item's key right before the item is removed.
pub type AboutToExpireCallback<K> = Arc<dyn Fn(&K) + Send + Sync>;

// == Item State ==
/// Mutable part of an item, guarded by the item's own lock.
struct ItemState<K> {
    accessed_on: Instant,
    access_count: u64,
    about_to_expire: Vec<AboutToExpireCallback<K>>,
}

// == Cache Item ==
/// A single cache entry: key, payload, idle lifespan and access statistics.
///
/// `key`, `data`, `life_span` and the creation times never change after
/// construction and are read without locking. The last access time, the hit
/// counter and the expiry callbacks sit behind the item's lock.
pub struct CacheItem<K, V> {
    key: K,
    data: V,
    life_span: Duration,
    created_on: Instant,
    created_at: DateTime<Utc>,
    state: RwLock<ItemState<K>>,
}

impl<K, V> CacheItem<K, V> {
    // == Constructor ==
    /// Creates a new item. A zero `life_span` means it never expires by
    /// inactivity.
    pub fn new(key: K, life_span: Duration, data: V) -> Self {
        let now = Instant::now();
        Self {
            key,
            data,
            life_span,
            created_on: now,
            created_at: Utc::now(),
            state: RwLock::new(ItemState {
                accessed_on: now,
                access_count: 0,
                about_to_expire: Vec::new(),
            }),
        }
    }

    // == Keep Alive ==
    /// Marks the item as accessed now and bumps its hit counter.
    pub fn keep_alive(&self) {
        let mut state = self.state.write();
        state.accessed_on = Instant::now();
        state.access_count += 1;
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn data(&self) -> &V {
        &self.data
    }

    pub fn life_span(&self) -> Duration {
        self.life_span
    }

    /// Monotonic creation time.
    pub fn created_on(&self) -> Instant {
        self.created_on
    }

    /// Wall-clock creation time, for diagnostics.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last successful read (or creation).
    pub fn accessed_on(&self) -> Instant {
        self.state.read().accessed_on
    }

    pub fn access_count(&self) -> u64 {
        self.state.read().access_count
    }

    // == Expiry ==
    /// Returns how long the item may still stay idle as of `now`.
    ///
    /// `None` for items that never expire, `Some(ZERO)` once the idle time
    /// has reached the lifespan.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.life_span.is_zero() {
            return None;
        }
        let idle = now.saturating_duration_since(self.accessed_on());
        Some(self.life_span.saturating_sub(idle))
    }

    /// Checks whether the item has been idle for at least its lifespan.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining(now).is_some_and(|left| left.is_zero())
    }

    // == Expiry Callbacks ==
    /// Replaces all expiry callbacks with `f`.
    pub fn set_about_to_expire_callback<F>(&self, f: F)
    where
        F: Fn(&K) + Send + Sync + 'static,
    {
        let mut state = self.state.write();
        state.about_to_expire.clear();
        state.about_to_expire.push(Arc::new(f));
    }

    /// Appends `f` to the expiry callbacks.
    pub fn add_about_to_expire_callback<F>(&self, f: F)
    where
        F: Fn(&K) + Send + Sync + 'static,
    {
        self.state.write().about_to_expire.push(Arc::new(f));
    }

    /// Drops every expiry callback.
    pub fn remove_about_to_expire_callbacks(&self) {
        self.state.write().about_to_expire.clear();
    }

    /// Snapshot of the expiry callbacks so they can run without the item lock.
    pub(crate) fn about_to_expire_callbacks(&self) -> Vec<AboutToExpireCallback<K>> {
        self.state.read().about_to_expire.clone()
    }

    /// Consumes the item into `(key, life_span, data)`.
    pub fn into_parts(self) -> (K, Duration, V) {
        (self.key, self.life_span, self.data)
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for CacheItem<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("CacheItem")
            .field("key", &self.key)
            .field("data", &self.data)
            .field("life_span", &self.life_span)
            .field("created_at", &self.created_at)
            .field("access_count", &state.access_count)
            .field("about_to_expire", &state.about_to_expire.len())
            .finish()
    }
}
