//! Deferred-task scheduling and the wall-clock source.
//!
//! The task manager runs one-shot jobs at wall-clock times; the stream
//! uses it to schedule reconnect attempts at the edge of the connection
//! window. All wall-clock reads in the crate go through [`Clock`] so
//! window arithmetic is deterministic under test.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source, unix seconds.
pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch.
    fn now(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A deferred job.
pub trait Task: Send + Sync {
    /// Runs the task. Returning `Some(when)` reschedules it for that
    /// wall-clock time; `None` disposes it.
    fn run(&self, now: u64) -> Option<u64>;
}

/// The scheduling surface the stream machinery consumes.
pub trait TaskManager: Send + Sync {
    /// Registers `task` to run at wall-clock time `fire_at`.
    fn register_task(&self, task: Arc<dyn Task>, fire_at: u64);
}
