//! Bounded map of per-identity windows.
//!
//! Each window sits behind its own mutex so checks for different identities
//! never contend, while checks for the same identity are serialized. The outer
//! map lock is only taken for writing when a key is inserted or removed.
//!
//! Handles to a window are only cloned under the map's read lock, so holding
//! the write lock and seeing `strong_count == 1` proves nobody is about to use
//! that window. Collection and eviction only ever remove such entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::window::Window;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct WindowKey {
    pub scope: String,
    pub identity: String,
}

impl WindowKey {
    pub fn new(scope: &str, identity: &str) -> Self {
        Self {
            scope: scope.to_string(),
            identity: identity.to_string(),
        }
    }
}

type Slot<W> = Arc<Mutex<W>>;

/// What happened to the table while making room for a new key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Housekeeping {
    /// An idle window was dropped to make room.
    pub evicted: bool,
    /// No window was idle, so the table grew past its bound.
    pub overflowed: bool,
}

#[derive(Debug)]
pub(crate) struct WindowTable<W> {
    slots: RwLock<HashMap<WindowKey, Slot<W>>>,
    max_keys: usize,
}

fn lock<W>(slot: &Mutex<W>) -> MutexGuard<'_, W> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<W: Window> WindowTable<W> {
    pub fn new(max_keys: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            max_keys: max_keys.max(1),
        }
    }

    /// Run `f` against the window for `key`, creating it with `make` if absent.
    pub fn with_window<R>(
        &self,
        key: &WindowKey,
        now: DateTime<Utc>,
        make: impl FnOnce() -> W,
        f: impl FnOnce(&mut W) -> R,
    ) -> (R, Housekeeping) {
        let existing = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots.get(key).cloned()
        };

        let (slot, housekeeping) = match existing {
            Some(slot) => (slot, Housekeeping::default()),
            None => self.insert(key, now, make),
        };

        let mut window = lock(&slot);
        (f(&mut window), housekeeping)
    }

    fn insert(
        &self,
        key: &WindowKey,
        now: DateTime<Utc>,
        make: impl FnOnce() -> W,
    ) -> (Slot<W>, Housekeeping) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        // Lost the race to another inserter.
        if let Some(slot) = slots.get(key) {
            return (slot.clone(), Housekeeping::default());
        }

        // Only idle windows may be evicted.
        let mut housekeeping = Housekeeping::default();
        if slots.len() >= self.max_keys {
            housekeeping.evicted = evict_least_recent_idle(&mut slots, now);
            housekeeping.overflowed = !housekeeping.evicted;
        }

        let slot = Arc::new(Mutex::new(make()));
        slots.insert(key.clone(), slot.clone());
        (slot, housekeeping)
    }

    /// Drop every window that no longer influences decisions.
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        purge_idle(&mut slots, now)
    }

    pub fn remove(&self, key: &WindowKey) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn purge_idle<W: Window>(slots: &mut HashMap<WindowKey, Slot<W>>, now: DateTime<Utc>) -> usize {
    let before = slots.len();
    slots.retain(|_, slot: &mut Slot<W>| Arc::strong_count(slot) > 1 || !lock(&**slot).is_idle(now));
    before - slots.len()
}

fn evict_least_recent_idle<W: Window>(
    slots: &mut HashMap<WindowKey, Slot<W>>,
    now: DateTime<Utc>,
) -> bool {
    let victim = slots
        .iter()
        .filter(|(_, slot)| Arc::strong_count(slot) == 1)
        .filter_map(|(key, slot)| {
            let window = lock(slot);
            window.is_idle(now).then(|| (window.last_used(), key))
        })
        .min_by_key(|(last_used, _)| *last_used)
        .map(|(_, key)| key.clone());

    match victim {
        Some(key) => {
            tracing::warn!(
                scope = %key.scope,
                identity = %key.identity,
                "admission table full; evicting least recently used idle window"
            );
            slots.remove(&key);
            true
        }
        None => false,
    }
}
