//! Sweep Timer Task
//!
//! One-shot timer that wakes a table's expiration sweep.

use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

/// Runtime hosting the sweep timers of every table not pinned to its own.
static SWEEPER_RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("cache-table-sweeper")
        .enable_time()
        .build()
        .expect("Failed to build the cache sweeper runtime")
});

/// Returns the crate's sweeper runtime, building it on first use.
///
/// It is independent of any runtime the caller happens to run on, so sweeps
/// keep firing when that runtime is blocked or shut down.
///
/// # Panics
/// Panics if the runtime cannot be built (the OS refuses a thread or timer).
pub fn timer_runtime() -> Handle {
    SWEEPER_RUNTIME.handle().clone()
}

/// Arms a one-shot sweep timer.
///
/// After `delay` the task hands `sweep` to the blocking pool, so user
/// callbacks fired by the sweep never run on an async worker. Aborting the
/// returned handle before `delay` elapses cancels the sweep.
///
/// # Arguments
/// * `runtime` - Runtime the timer runs on
/// * `table` - Table name, for log correlation
/// * `delay` - Time until the sweep fires
/// * `sweep` - The sweep to run
///
/// # Example
/// ```ignore
/// let handle = spawn_sweep_timer(&timer_runtime(), "sessions", delay, move || sweep());
/// // Later, when rescheduling:
/// handle.abort();
/// ```
pub fn spawn_sweep_timer<F>(
    runtime: &Handle,
    table: &str,
    delay: Duration,
    sweep: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let table = table.to_owned();
    runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        debug!(table = %table, "Sweep timer fired after {:?}", delay);
        // Detached: a later reschedule aborts only the timer, never a running sweep
        drop(tokio::task::spawn_blocking(sweep));
    })
}
