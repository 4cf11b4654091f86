//! Background Tasks Module
//!
//! Contains the timer tasks that run alongside cache tables.
//!
//! # Tasks
//! - Sweep timer: wakes a table's expiration sweep at its next expiry

mod sweeper;

pub use sweeper::{spawn_sweep_timer, timer_runtime};
