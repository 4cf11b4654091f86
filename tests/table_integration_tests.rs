//! Integration Tests for Cache Tables
//!
//! Exercises expiry timing, loaders, callbacks and concurrent access through
//! the public API.

use cache_table::{CacheError, CacheItem, CacheTable, TableConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, Once};
use std::thread::{self, sleep};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// == Helper Functions ==

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn create_test_table<V>() -> CacheTable<String, V>
where
    V: Send + Sync + 'static,
{
    init_tracing();
    CacheTable::with_config("integration", TableConfig::from_env())
}

// == Expiry Tests ==

#[test]
fn test_item_expires_after_idle_lifespan() {
    let table = create_test_table::<&str>();
    let expired_keys = Arc::new(Mutex::new(Vec::new()));

    let item = table.add("a".into(), Duration::from_millis(50), "x");
    let seen = expired_keys.clone();
    item.set_about_to_expire_callback(move |key: &String| {
        seen.lock().unwrap().push(key.clone());
    });

    sleep(Duration::from_millis(10));
    assert!(table.exists(&"a".into()));

    sleep(Duration::from_millis(60));
    assert!(!table.exists(&"a".into()));
    assert_eq!(*expired_keys.lock().unwrap(), vec!["a".to_string()]);
}

#[test]
fn test_keep_alive_prevents_expiry() {
    let table = create_test_table::<u32>();
    table.add("hot".into(), Duration::from_millis(100), 1);

    for _ in 0..10 {
        sleep(Duration::from_millis(30));
        assert!(table.value(&"hot".into()).is_ok(), "Touched item must not expire");
    }

    let item = table.value(&"hot".into()).unwrap();
    assert_eq!(item.access_count(), 11);
}

#[test]
fn test_mixed_lifespans_expire_in_order() {
    let table = create_test_table::<u32>();
    table.add("short".into(), Duration::from_millis(40), 1);
    table.add("long".into(), Duration::from_millis(250), 2);
    table.add("forever".into(), Duration::ZERO, 3);

    sleep(Duration::from_millis(120));
    assert!(!table.exists(&"short".into()));
    assert!(table.exists(&"long".into()));

    sleep(Duration::from_millis(250));
    assert!(!table.exists(&"long".into()));
    assert!(table.exists(&"forever".into()));
    assert!(table.cleanup_interval().is_zero());
    assert_eq!(table.stats().expirations, 2);
}

#[test]
fn test_flush_cancels_pending_sweep() {
    let table = create_test_table::<u32>();
    let deletes = Arc::new(AtomicUsize::new(0));
    let counter = deletes.clone();
    table.set_about_to_delete_item_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    table.add("a".into(), Duration::from_millis(30), 1);
    table.flush();
    table.add("b".into(), Duration::ZERO, 2);

    sleep(Duration::from_millis(100));
    assert_eq!(deletes.load(Ordering::SeqCst), 0);
    assert!(table.exists(&"b".into()));
    assert_eq!(table.count(), 1);
}

#[test]
fn test_sweep_callback_can_reenter_table() {
    let table = create_test_table::<u32>();
    let handle = table.clone();
    table.set_about_to_delete_item_callback(move |item| {
        handle.add(format!("{}-archived", item.key()), Duration::ZERO, *item.data());
    });

    table.add("session".into(), Duration::from_millis(30), 9);
    sleep(Duration::from_millis(120));

    assert!(!table.exists(&"session".into()));
    assert_eq!(*table.value(&"session-archived".into()).unwrap().data(), 9);
}

// == Loader Tests ==

#[test]
fn test_value_miss_without_loader() {
    let table = create_test_table::<i32>();
    assert_eq!(
        table.value(&"missing".into()).unwrap_err(),
        CacheError::KeyNotFound
    );
}

#[test]
fn test_value_miss_with_empty_loader() {
    let table = create_test_table::<i32>();
    table.set_data_loader(|_, _| None);

    assert_eq!(
        table.value(&"missing".into()).unwrap_err(),
        CacheError::KeyNotFoundOrLoadable
    );
}

#[test]
fn test_value_miss_with_loader() {
    let table = create_test_table::<i32>();
    table.set_data_loader(|key: &String, _| {
        Some(CacheItem::new(key.clone(), Duration::from_secs(1), 42))
    });

    let item = table.value(&"missing".into()).unwrap();
    assert_eq!(*item.data(), 42);
    assert!(table.exists(&"missing".into()));

    // Second lookup is a hit on the stored entry
    let again = table.value(&"missing".into()).unwrap();
    assert!(Arc::ptr_eq(&item, &again));
    assert_eq!(table.stats().loads, 1);
}

// == Overwrite Tests ==

#[test]
fn test_add_overwrites_existing_key() {
    let table = create_test_table::<i32>();
    let first = table.add("a".into(), Duration::ZERO, 1);
    table.value(&"a".into()).unwrap();
    assert_eq!(first.access_count(), 1);

    let second = table.add("a".into(), Duration::ZERO, 2);
    assert_eq!(second.access_count(), 0);

    let item = table.value(&"a".into()).unwrap();
    assert_eq!(*item.data(), 2);
    assert_eq!(item.access_count(), 1);
}

// == Concurrency Tests ==

#[test]
fn test_concurrent_not_found_add_single_winner() {
    let table = create_test_table::<usize>();
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|id| {
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                table.not_found_add("shared".into(), Duration::ZERO, id)
            })
        })
        .collect();

    let winners: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(winners.iter().filter(|won| **won).count(), 1);
    assert_eq!(table.count(), 1);
}

#[test]
fn test_concurrent_mixed_operations() {
    let table = create_test_table::<usize>();
    let added = Arc::new(AtomicUsize::new(0));
    let counter = added.clone();
    table.add_added_item_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let table = table.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("k{}", i % 20);
                    match (worker + i) % 4 {
                        0 => {
                            table.add(key, Duration::from_millis(5 + (i % 7) as u64), i);
                        }
                        1 => {
                            let _ = table.value(&key);
                        }
                        2 => {
                            let _ = table.delete(&key);
                        }
                        _ => {
                            table.not_found_add(key, Duration::ZERO, i);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(table.count() <= 20);
    assert!(added.load(Ordering::SeqCst) >= 400);
}

// == Runtime Tests ==

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweeps_run_inside_multi_thread_runtime() {
    let table = create_test_table::<u32>();
    table.add("a".into(), Duration::from_millis(30), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!table.exists(&"a".into()));
}

#[test]
fn test_table_outlives_runtime_it_was_built_in() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let table = runtime.block_on(async { create_test_table::<u32>() });
    drop(runtime);

    table.add("a".into(), Duration::from_millis(30), 1);
    sleep(Duration::from_millis(200));

    assert!(!table.exists(&"a".into()));
    assert!(table.cleanup_interval().is_zero());
}

#[tokio::test]
async fn test_sweeps_run_while_current_thread_runtime_blocks() {
    let table = create_test_table::<u32>();
    table.add("a".into(), Duration::from_millis(50), 1);

    // Blocking sleep starves this runtime; expiry must not depend on it
    sleep(Duration::from_millis(150));
    assert!(!table.exists(&"a".into()));
}

#[test]
fn test_stats_serialize() {
    let table = create_test_table::<u32>();
    table.add("a".into(), Duration::ZERO, 1);
    table.value(&"a".into()).unwrap();
    let _ = table.value(&"b".into());

    let json = serde_json::to_value(table.stats()).unwrap();
    assert_eq!(json["hits"], 1);
    assert_eq!(json["misses"], 1);
    assert_eq!(json["total_entries"], 1);
}
