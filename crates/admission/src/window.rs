//! Per-identity usage state for both algorithms.
//!
//! Window types are plain data; serialization of concurrent access is the
//! table's job.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use jobgate_core::to_chrono;

use crate::policy::{AdmissionPolicy, Decision};

/// Usage state the window table can garbage-collect.
pub(crate) trait Window: Send + 'static {
    /// True when dropping this state cannot change any future decision.
    fn is_idle(&self, now: DateTime<Utc>) -> bool;

    fn last_used(&self) -> DateTime<Utc>;
}

/// Fixed-window counter: `count` hits until `reset_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    count: u32,
    reset_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

impl FixedWindow {
    /// An already-expired window; the first check opens a fresh one.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            reset_at: now,
            last_used: now,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// Decide and, when allowed, consume one unit.
    pub fn check(&mut self, policy: &AdmissionPolicy, now: DateTime<Utc>) -> Decision {
        if now >= self.reset_at {
            self.count = 0;
            self.reset_at = now + to_chrono(policy.window);
        }
        self.last_used = now;

        if self.count < policy.quota {
            self.count += 1;
            Decision::allow(policy.quota - self.count, self.reset_at)
        } else {
            Decision::deny(self.reset_at, now)
        }
    }
}

impl Window for FixedWindow {
    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    fn last_used(&self) -> DateTime<Utc> {
        self.last_used
    }
}

/// Sliding-window log of admitted hits, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow {
    hits: VecDeque<DateTime<Utc>>,
    span: chrono::Duration,
    last_used: DateTime<Utc>,
}

impl SlidingWindow {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            hits: VecDeque::new(),
            span: chrono::Duration::zero(),
            last_used: now,
        }
    }

    /// Hits currently retained (may include expired ones until the next check).
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    fn trim(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.span;
        while self.hits.front().is_some_and(|&t| t <= cutoff) {
            self.hits.pop_front();
        }
    }

    /// Decide and, when allowed, record a hit at `now`.
    pub fn check(&mut self, policy: &AdmissionPolicy, now: DateTime<Utc>) -> Decision {
        self.span = to_chrono(policy.window);
        self.last_used = now;
        self.trim(now);

        let quota = policy.quota as usize;
        if self.hits.len() < quota {
            self.hits.push_back(now);
            let oldest = self.hits.front().copied().unwrap_or(now);
            Decision::allow((quota - self.hits.len()) as u32, oldest + self.span)
        } else {
            let oldest = self.hits.front().copied().unwrap_or(now);
            Decision::deny(oldest + self.span, now)
        }
    }
}

impl Window for SlidingWindow {
    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.span;
        self.hits.back().is_none_or(|&t| t <= cutoff)
    }

    fn last_used(&self) -> DateTime<Utc> {
        self.last_used
    }
}
