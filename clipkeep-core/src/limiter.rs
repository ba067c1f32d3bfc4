use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitSection;

/// Admission control consulted before a job is queued.
///
/// The in-process implementation only protects a single intake process;
/// several intake processes need an implementation backed by shared state.
pub trait AdmissionLimiter: Send + Sync {
    /// Records an admission and returns true, or returns false when the
    /// submitter is over quota.
    fn allow(&self, submitter: &str) -> bool;

    /// Admissions still available in the current window.
    fn remaining(&self, submitter: &str) -> u32;

    /// Gives back the most recent admission, for a submission that was
    /// admitted but could not be queued.
    fn release(&self, submitter: &str);
}

/// Per-submitter sliding window kept in memory. Resets on restart.
pub struct SlidingWindowLimiter {
    quota: u32,
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

#[derive(Default)]
struct LimiterState {
    admissions: HashMap<String, VecDeque<DateTime<Utc>>>,
    purged_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("quota", &self.quota)
            .field("window", &self.window)
            .finish()
    }
}

impl SlidingWindowLimiter {
    pub fn new(quota: u32, window: Duration) -> Self {
        Self::with_clock(quota, window, Arc::new(SystemClock))
    }

    pub fn with_clock(quota: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1));
        Self {
            quota,
            window,
            clock,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn from_config(section: &RateLimitSection, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(
            section.max_submissions,
            Duration::from_secs(section.window_seconds),
            clock,
        )
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    fn prune(&self, history: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while history.front().map(|ts| *ts <= cutoff).unwrap_or(false) {
            history.pop_front();
        }
    }

    /// Drops submitters with no admissions left in the window.
    pub fn purge_idle(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut state, now);
    }

    pub fn tracked_submitters(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admissions
            .len()
    }

    fn purge(&self, state: &mut LimiterState, now: DateTime<Utc>) {
        state.admissions.retain(|_, history| {
            self.prune(history, now);
            !history.is_empty()
        });
        state.purged_at = Some(now);
    }

    /// Purges at most once per window.
    fn purge_if_due(&self, state: &mut LimiterState, now: DateTime<Utc>) {
        let due = state
            .purged_at
            .map_or(true, |last| now - last >= self.window);
        if due {
            self.purge(state, now);
        }
    }
}

impl AdmissionLimiter for SlidingWindowLimiter {
    fn allow(&self, submitter: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge_if_due(&mut state, now);
        let history = state.admissions.entry(submitter.to_string()).or_default();
        self.prune(history, now);
        if history.len() >= self.quota as usize {
            return false;
        }
        history.push_back(now);
        true
    }

    fn remaining(&self, submitter: &str) -> u32 {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.admissions.get_mut(submitter) {
            Some(history) => {
                self.prune(history, now);
                self.quota.saturating_sub(history.len() as u32)
            }
            None => self.quota,
        }
    }

    fn release(&self, submitter: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(history) = state.admissions.get_mut(submitter) {
            history.pop_back();
        }
    }
}
