//! Priority queue of pending jobs.
//!
//! Ordered by priority tier, then eligibility time, then insertion order.
//! A tier whose head is not yet eligible is skipped, so a delayed job never
//! blocks eligible work behind it.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use jobgate_core::JobId;

use crate::types::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Priority,
    scheduled_at: DateTime<Utc>,
    seq: u64,
}

impl QueueKey {
    /// Smallest possible key within a tier.
    fn tier_start(priority: Priority) -> Self {
        Self {
            priority,
            scheduled_at: DateTime::<Utc>::MIN_UTC,
            seq: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    entries: BTreeMap<QueueKey, JobId>,
    index: HashMap<JobId, QueueKey>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or re-insert) a job. Re-inserting moves it to the back of its
    /// `(priority, scheduled_at)` position.
    pub fn push(&mut self, id: JobId, priority: Priority, scheduled_at: DateTime<Utc>) {
        self.remove(id);
        let key = QueueKey {
            priority,
            scheduled_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, id);
        self.index.insert(id, key);
    }

    pub fn remove(&mut self, id: JobId) -> bool {
        match self.index.remove(&id) {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    fn tier_head(&self, priority: Priority) -> Option<(&QueueKey, &JobId)> {
        self.entries
            .range(QueueKey::tier_start(priority)..)
            .next()
            .filter(|(key, _)| key.priority == priority)
    }

    /// Remove and return the highest-priority job eligible at `now`.
    pub fn pop_eligible(&mut self, now: DateTime<Utc>) -> Option<JobId> {
        let key = Priority::ALL.into_iter().find_map(|priority| {
            self.tier_head(priority)
                .filter(|(key, _)| key.scheduled_at <= now)
                .map(|(key, _)| *key)
        })?;

        let id = self.entries.remove(&key)?;
        self.index.remove(&id);
        Some(id)
    }

    /// Earliest `scheduled_at` among the tier heads.
    pub fn next_eligible_at(&self) -> Option<DateTime<Utc>> {
        Priority::ALL
            .into_iter()
            .filter_map(|priority| self.tier_head(priority).map(|(key, _)| key.scheduled_at))
            .min()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued ids in queue order (ignoring eligibility).
    pub fn ids(&self) -> Vec<JobId> {
        self.entries.values().copied().collect()
    }
}
