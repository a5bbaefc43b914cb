//! Dirty-user tracking: decides when a user's pending messages fire a batch.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::error::{MemoryError, Result};

#[derive(Debug, Default)]
struct UpdateTracker {
    message_count: usize,
    first_touched: Option<Instant>,
}

impl UpdateTracker {
    fn mark(&mut self) {
        self.message_count += 1;
        if self.first_touched.is_none() {
            self.first_touched = Some(Instant::now());
        }
    }

    /// A tracker fires once it holds at least one message and either the
    /// message limit or the time limit is reached.  A tracker with zero
    /// messages never fires, even long past the time limit.
    fn should_fire(&self, message_limit: usize, time_limit: Duration) -> bool {
        if self.message_count == 0 {
            return false;
        }
        let past_deadline = self
            .first_touched
            .map(|first| first.elapsed() >= time_limit)
            .unwrap_or(false);
        past_deadline || self.message_count >= message_limit
    }

    fn reset(&mut self) {
        self.message_count = 0;
        self.first_touched = None;
    }
}

/// Per-user dirty tracking behind a single lock; `mark_update` and
/// `take_users_to_update` are safe to call from concurrent tasks.
pub struct UpdateTrackerManager {
    trackers: Mutex<HashMap<String, UpdateTracker>>,
    message_limit: usize,
    time_limit: Duration,
}

impl UpdateTrackerManager {
    pub fn new(message_limit: usize, time_limit_sec: f64) -> Result<Self> {
        if message_limit == 0 {
            return Err(MemoryError::InvalidInput(
                "message_limit must be positive".to_string(),
            ));
        }
        if !(time_limit_sec > 0.0) {
            return Err(MemoryError::InvalidInput(
                "time_limit_sec must be positive".to_string(),
            ));
        }
        Ok(Self {
            trackers: Mutex::new(HashMap::new()),
            message_limit,
            time_limit: Duration::from_secs_f64(time_limit_sec),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UpdateTracker>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one new pending message for `user`.
    pub fn mark_update(&self, user: &str) {
        let mut trackers = self.lock();
        trackers.entry(user.to_string()).or_default().mark();
        trace!(user, "marked dirty");
    }

    /// Atomically collect every user whose tracker currently fires and reset
    /// those trackers to idle.  Users below both thresholds are untouched.
    pub fn take_users_to_update(&self) -> Vec<String> {
        let mut trackers = self.lock();
        let mut due = Vec::new();
        for (user, tracker) in trackers.iter_mut() {
            if tracker.should_fire(self.message_limit, self.time_limit) {
                due.push(user.clone());
                tracker.reset();
            }
        }
        due
    }
}
