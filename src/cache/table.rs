//! Cache Table Module
//!
//! Main cache engine: a keyed map of items, lifecycle callbacks, an optional
//! miss loader and the self-rescheduling expiration sweep.
//!
//! # Locking
//! One table lock guards the map, the sweep state and the callback lists.
//! Each item has its own lock for its access statistics. The order is always
//! table lock, then item lock.
//!
//! User callbacks may call back into the same table. The add and delete paths
//! therefore release the table lock while callbacks run and reacquire it to
//! finish. Other threads can observe and mutate the table inside that window.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockWriteGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::Level;

use crate::cache::stats::StatsRecorder;
use crate::cache::{CacheItem, CacheStats};
use crate::config::TableConfig;
use crate::error::{CacheError, Result};
use crate::tasks::{spawn_sweep_timer, timer_runtime};

/// Callback invoked with an item on insertion or right before deletion.
pub type ItemCallback<K, V> = Arc<dyn Fn(&Arc<CacheItem<K, V>>) + Send + Sync>;

/// Miss loader: receives the key and the caller's extra arguments and may
/// produce an item to insert.
pub type DataLoader<K, V> =
    Arc<dyn Fn(&K, &[&dyn Any]) -> Option<CacheItem<K, V>> + Send + Sync>;

// == Table State ==
/// Everything guarded by the table lock.
struct TableState<K, V> {
    items: HashMap<K, Arc<CacheItem<K, V>>>,
    /// Delay of the pending sweep, zero when idle
    cleanup_interval: Duration,
    cleanup_timer: Option<JoinHandle<()>>,
    load_data: Option<DataLoader<K, V>>,
    added_item: Vec<ItemCallback<K, V>>,
    about_to_delete_item: Vec<ItemCallback<K, V>>,
    log_level: Option<Level>,
}

impl<K, V> TableState<K, V> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.cleanup_timer.take() {
            timer.abort();
        }
    }
}

struct TableInner<K, V> {
    name: String,
    runtime: Handle,
    state: RwLock<TableState<K, V>>,
    stats: StatsRecorder,
}

impl<K, V> Drop for TableInner<K, V> {
    fn drop(&mut self) {
        self.state.get_mut().cancel_timer();
    }
}

/// Emits a diagnostic line at the table's configured level, if any.
macro_rules! table_log {
    ($level:expr, $table:expr, $($arg:tt)+) => {
        if let Some(level) = $level {
            let table: &str = &$table;
            if level == Level::ERROR {
                tracing::error!(table, $($arg)+);
            } else if level == Level::WARN {
                tracing::warn!(table, $($arg)+);
            } else if level == Level::INFO {
                tracing::info!(table, $($arg)+);
            } else if level == Level::DEBUG {
                tracing::debug!(table, $($arg)+);
            } else {
                tracing::trace!(table, $($arg)+);
            }
        }
    };
}

// == Cache Table ==
/// Concurrency-safe key/value table whose entries expire after a period of
/// inactivity.
///
/// `CacheTable` is a cheap handle: clones share the same table.
pub struct CacheTable<K, V> {
    inner: Arc<TableInner<K, V>>,
}

impl<K, V> Clone for CacheTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for CacheTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTable")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<K, V> CacheTable<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // == Constructors ==
    /// Creates a silent table.
    ///
    /// Sweep timers run on the crate's own background runtime.
    ///
    /// # Panics
    /// The first table built without [`with_runtime`](Self::with_runtime)
    /// starts that runtime and panics if the OS refuses it a thread.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, TableConfig::default())
    }

    /// Creates a table with the given configuration.
    ///
    /// # Panics
    /// Same as [`new`](Self::new).
    pub fn with_config(name: impl Into<String>, config: TableConfig) -> Self {
        Self::with_runtime(name, config, timer_runtime())
    }

    /// Creates a table whose sweep timers run on `runtime`.
    ///
    /// The caller keeps `runtime` alive and unblocked for as long as the table
    /// needs expiry. Once it shuts down no timer can be armed and the table
    /// falls back to sweeping inline on the next expiring `add`.
    pub fn with_runtime(name: impl Into<String>, config: TableConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(TableInner {
                name: name.into(),
                runtime,
                state: RwLock::new(TableState {
                    items: HashMap::new(),
                    cleanup_interval: Duration::ZERO,
                    cleanup_timer: None,
                    load_data: None,
                    added_item: Vec::new(),
                    about_to_delete_item: Vec::new(),
                    log_level: config.log_level,
                }),
                stats: StatsRecorder::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // == Count ==
    /// Returns the current number of entries.
    pub fn count(&self) -> usize {
        self.inner.state.read().items.len()
    }

    // == Foreach ==
    /// Visits every entry while holding the table's read lock.
    ///
    /// `visit` must not mutate the table: any write from inside it deadlocks.
    pub fn foreach<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &Arc<CacheItem<K, V>>),
    {
        let state = self.inner.state.read();
        for (key, item) in state.items.iter() {
            visit(key, item);
        }
    }

    // == Configuration ==
    /// Sets the loader invoked on lookup misses.
    pub fn set_data_loader<F>(&self, f: F)
    where
        F: Fn(&K, &[&dyn Any]) -> Option<CacheItem<K, V>> + Send + Sync + 'static,
    {
        self.inner.state.write().load_data = Some(Arc::new(f));
    }

    /// Removes the miss loader.
    pub fn remove_data_loader(&self) {
        self.inner.state.write().load_data = None;
    }

    /// Replaces all on-add callbacks with `f`.
    pub fn set_added_item_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.write();
        state.added_item.clear();
        state.added_item.push(Arc::new(f));
    }

    /// Appends `f` to the on-add callbacks.
    pub fn add_added_item_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        self.inner.state.write().added_item.push(Arc::new(f));
    }

    pub fn remove_added_item_callbacks(&self) {
        self.inner.state.write().added_item.clear();
    }

    /// Replaces all about-to-delete callbacks with `f`.
    pub fn set_about_to_delete_item_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.write();
        state.about_to_delete_item.clear();
        state.about_to_delete_item.push(Arc::new(f));
    }

    /// Appends `f` to the about-to-delete callbacks.
    pub fn add_about_to_delete_item_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        self.inner.state.write().about_to_delete_item.push(Arc::new(f));
    }

    pub fn remove_about_to_delete_item_callbacks(&self) {
        self.inner.state.write().about_to_delete_item.clear();
    }

    /// Sets the level of the table's diagnostic lines; `None` silences them.
    pub fn set_log_level(&self, level: Option<Level>) {
        self.inner.state.write().log_level = level;
    }

    // == Add ==
    /// Stores `data` under `key`, replacing any existing entry.
    ///
    /// A zero `life_span` keeps the entry until it is deleted or flushed.
    /// Returns the stored item.
    pub fn add(&self, key: K, life_span: Duration, data: V) -> Arc<CacheItem<K, V>> {
        let item = Arc::new(CacheItem::new(key, life_span, data));
        let state = self.inner.state.write();
        self.add_internal(state, Arc::clone(&item));
        item
    }

    // == Not Found Add ==
    /// Stores `data` under `key` only if the key is absent.
    ///
    /// The check and the insert happen under one write lock. Returns whether
    /// the entry was inserted.
    pub fn not_found_add(&self, key: K, life_span: Duration, data: V) -> bool {
        let state = self.inner.state.write();
        if state.items.contains_key(&key) {
            return false;
        }
        let item = Arc::new(CacheItem::new(key, life_span, data));
        self.add_internal(state, item);
        true
    }

    // == Delete ==
    /// Removes the entry under `key`, firing the about-to-delete and the
    /// item's about-to-expire callbacks first.
    pub fn delete(&self, key: &K) -> Result<Arc<CacheItem<K, V>>> {
        let mut state = self.inner.state.write();
        let item = self.delete_internal(&mut state, key)?;
        self.inner.stats.record_deletion();
        Ok(item)
    }

    // == Exists ==
    /// Checks for `key` without touching its idle clock.
    pub fn exists(&self, key: &K) -> bool {
        self.inner.state.read().items.contains_key(key)
    }

    // == Value ==
    /// Looks up `key`, refreshing its idle clock on a hit.
    ///
    /// On a miss the loader, if configured, is asked for the entry.
    pub fn value(&self, key: &K) -> Result<Arc<CacheItem<K, V>>> {
        self.value_with(key, &[])
    }

    /// Like [`value`](Self::value), forwarding `args` to the loader.
    ///
    /// When the loader supplies the entry, the returned reference is the newly
    /// stored item (with `access_count == 0`), not the item the loader built.
    pub fn value_with(&self, key: &K, args: &[&dyn Any]) -> Result<Arc<CacheItem<K, V>>> {
        let (found, loader) = {
            let state = self.inner.state.read();
            (state.items.get(key).cloned(), state.load_data.clone())
        };

        if let Some(item) = found {
            item.keep_alive();
            self.inner.stats.record_hit();
            return Ok(item);
        }
        self.inner.stats.record_miss();

        let Some(loader) = loader else {
            return Err(CacheError::KeyNotFound);
        };
        match loader(key, args) {
            Some(loaded) => {
                // Only the payload and lifespan are kept; the entry starts a fresh lineage
                let (_, life_span, data) = loaded.into_parts();
                self.inner.stats.record_load();
                Ok(self.add(key.clone(), life_span, data))
            }
            None => Err(CacheError::KeyNotFoundOrLoadable),
        }
    }

    // == Flush ==
    /// Drops every entry and cancels the pending sweep. No callbacks fire.
    pub fn flush(&self) {
        let mut state = self.inner.state.write();
        table_log!(state.log_level, self.inner.name, "Flushing table");
        state.items = HashMap::new();
        state.cleanup_interval = Duration::ZERO;
        state.cancel_timer();
    }

    // == Most Accessed ==
    /// Returns up to `count` items, most accessed first.
    pub fn most_accessed(&self, count: usize) -> Vec<Arc<CacheItem<K, V>>> {
        let state = self.inner.state.read();
        let mut ranked: Vec<(u64, &Arc<CacheItem<K, V>>)> = state
            .items
            .values()
            .map(|item| (item.access_count(), item))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked
            .into_iter()
            .take(count)
            .map(|(_, item)| Arc::clone(item))
            .collect()
    }

    // == Stats ==
    /// Returns a snapshot of the table's counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot(self.count())
    }

    /// Delay until the pending sweep; zero when no sweep is scheduled.
    pub fn cleanup_interval(&self) -> Duration {
        self.inner.state.read().cleanup_interval
    }

    // == Internal: Add ==
    /// Inserts `item`, runs the on-add callbacks without the lock and
    /// reschedules the sweep if the item expires sooner than the pending one.
    fn add_internal(
        &self,
        mut state: RwLockWriteGuard<'_, TableState<K, V>>,
        item: Arc<CacheItem<K, V>>,
    ) {
        table_log!(
            state.log_level,
            self.inner.name,
            "Adding key {:?} with lifespan {:?}",
            item.key(),
            item.life_span()
        );
        state.items.insert(item.key().clone(), Arc::clone(&item));
        let scheduled = state.cleanup_interval;
        let callbacks = state.added_item.clone();
        drop(state);

        for callback in &callbacks {
            callback(&item);
        }

        let life_span = item.life_span();
        if !life_span.is_zero() && (scheduled.is_zero() || life_span < scheduled) {
            self.expiration_check();
        }
    }

    // == Internal: Delete ==
    /// Removes `key`, running callbacks with the table lock released.
    ///
    /// The map entry is removed afterwards only if it still holds the same
    /// item, so a callback that re-adds the key keeps its new entry.
    fn delete_internal(
        &self,
        state: &mut RwLockWriteGuard<'_, TableState<K, V>>,
        key: &K,
    ) -> Result<Arc<CacheItem<K, V>>> {
        let item = state.items.get(key).cloned().ok_or(CacheError::KeyNotFound)?;
        let callbacks = state.about_to_delete_item.clone();

        RwLockWriteGuard::unlocked(state, || {
            for callback in &callbacks {
                callback(&item);
            }
            for callback in item.about_to_expire_callbacks() {
                callback(key);
            }
        });

        table_log!(
            state.log_level,
            self.inner.name,
            "Deleting key {:?}, created at {}, accessed {} times",
            key,
            item.created_at().to_rfc3339(),
            item.access_count()
        );
        if state
            .items
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &item))
        {
            state.items.remove(key);
        }
        Ok(item)
    }

    // == Internal: Expiration Check ==
    /// Expires idle items and arms a timer for the next earliest expiry.
    ///
    /// Runs inline from `add` and from the sweep timer.
    fn expiration_check(&self) {
        let mut state = self.inner.state.write();
        state.cancel_timer();
        if state.cleanup_interval.is_zero() {
            table_log!(state.log_level, self.inner.name, "Expiration check installed");
        } else {
            table_log!(
                state.log_level,
                self.inner.name,
                "Expiration check after {:?}",
                state.cleanup_interval
            );
        }

        let now = Instant::now();
        let expired: Vec<(K, Arc<CacheItem<K, V>>)> = state
            .items
            .iter()
            .filter(|(_, item)| item.is_expired(now))
            .map(|(key, item)| (key.clone(), Arc::clone(item)))
            .collect();

        for (key, item) in expired {
            // The lock drops during callbacks, so skip slots replaced or flushed meanwhile
            let still_present = state
                .items
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &item));
            if still_present && self.delete_internal(&mut state, &key).is_ok() {
                self.inner.stats.record_expiration();
            }
        }

        let next = next_expiry(&state.items, Instant::now());
        state.cancel_timer();
        state.cleanup_interval = next;
        if !next.is_zero() {
            let table = Arc::downgrade(&self.inner);
            let timer = spawn_sweep_timer(&self.inner.runtime, &self.inner.name, next, move || {
                sweep(table)
            });
            if timer.is_finished() {
                // Runtime shut down: stay idle so the next expiring add sweeps inline
                tracing::warn!(table = %self.inner.name, "Sweep timer runtime is gone");
                state.cleanup_interval = Duration::ZERO;
            } else {
                state.cleanup_timer = Some(timer);
            }
        }
    }
}

/// Entry point of a fired sweep timer.
fn sweep<K, V>(table: Weak<TableInner<K, V>>)
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    if let Some(inner) = table.upgrade() {
        CacheTable { inner }.expiration_check();
    }
}

/// Smallest remaining idle time over all expirable items, zero if none.
///
/// Items that ran out while callbacks were running get the minimum delay so
/// the next sweep picks them up.
fn next_expiry<K, V>(items: &HashMap<K, Arc<CacheItem<K, V>>>, now: Instant) -> Duration {
    const MIN_DELAY: Duration = Duration::from_millis(1);

    items
        .values()
        .filter_map(|item| item.remaining(now))
        .map(|left| left.max(MIN_DELAY))
        .min()
        .unwrap_or(Duration::ZERO)
}
