//! Shared position counters.
//!
//! Every publication and subscription allocates one labelled counter whose
//! value tracks its stream position. The labels carry a load-bearing prefix:
//! the driver manager's shutdown loop refuses to force-close the driver
//! while any counter labelled `sender pos` or `subscriber pos` remains,
//! because tearing the driver down under an active position risks losing
//! frames a reader has not drained.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

/// Label prefix for publication position counters.
pub const SENDER_POS_PREFIX: &str = "sender pos";

/// Label prefix for subscription position counters.
pub const SUBSCRIBER_POS_PREFIX: &str = "subscriber pos";

struct Slot {
    label: String,
    value: Arc<AtomicU64>,
}

/// Allocation table behind [`CountersReader`].
#[derive(Default)]
pub(crate) struct CounterSet {
    slots: Mutex<Vec<Option<Slot>>>,
}

impl CounterSet {
    /// Allocate a counter; returns its id and the shared value cell.
    pub(crate) fn allocate(&self, label: String) -> (usize, Arc<AtomicU64>) {
        let value = Arc::new(AtomicU64::new(0));
        let slot = Slot { label, value: Arc::clone(&value) };

        let mut slots = lock_ignoring_poison(&self.slots);
        if let Some(id) = slots.iter().position(Option::is_none) {
            slots[id] = Some(slot);
            (id, value)
        } else {
            slots.push(Some(slot));
            (slots.len() - 1, value)
        }
    }

    /// Free a counter id; freed ids are recycled.
    pub(crate) fn free(&self, id: usize) {
        let mut slots = lock_ignoring_poison(&self.slots);
        if let Some(slot) = slots.get_mut(id) {
            *slot = None;
        }
    }

    pub(crate) fn reader(self: &Arc<Self>) -> CountersReader {
        CountersReader { set: Arc::clone(self) }
    }
}

/// Read-only enumeration over the driver's counters.
#[derive(Clone)]
pub struct CountersReader {
    set: Arc<CounterSet>,
}

impl CountersReader {
    /// Visit every live counter as `(id, label, value)`.
    pub fn for_each(&self, mut f: impl FnMut(usize, &str, u64)) {
        let slots = lock_ignoring_poison(&self.set.slots);
        for (id, slot) in slots.iter().enumerate() {
            if let Some(slot) = slot {
                f(id, &slot.label, slot.value.load(Ordering::Acquire));
            }
        }
    }

    /// Whether any `sender pos` / `subscriber pos` counter is still live.
    #[must_use]
    pub fn has_position_counters(&self) -> bool {
        let mut found = false;
        self.for_each(|_, label, _| {
            if label.starts_with(SENDER_POS_PREFIX) || label.starts_with(SUBSCRIBER_POS_PREFIX) {
                found = true;
            }
        });
        found
    }
}

/// A poisoned counter lock only means a panicking thread died mid-update;
/// the table itself stays structurally valid.
fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_enumerate() {
        let set = Arc::new(CounterSet::default());
        let (id, value) = set.allocate("sender pos: mem:test stream=1".to_string());
        value.store(7, Ordering::Release);

        let mut seen = Vec::new();
        set.reader().for_each(|i, label, v| seen.push((i, label.to_string(), v)));

        assert_eq!(seen, vec![(id, "sender pos: mem:test stream=1".to_string(), 7)]);
        assert!(set.reader().has_position_counters());
    }

    #[test]
    fn freed_counters_disappear_and_ids_recycle() {
        let set = Arc::new(CounterSet::default());
        let (a, _) = set.allocate("sender pos: a".to_string());
        let (_b, _) = set.allocate("subscriber pos: b".to_string());

        set.free(a);
        let (c, _) = set.allocate("sender pos: c".to_string());
        assert_eq!(c, a);

        let mut labels = Vec::new();
        set.reader().for_each(|_, label, _| labels.push(label.to_string()));
        labels.sort();
        assert_eq!(labels, vec!["sender pos: c".to_string(), "subscriber pos: b".to_string()]);
    }

    #[test]
    fn unrelated_labels_do_not_block_shutdown() {
        let set = Arc::new(CounterSet::default());
        let (_, _) = set.allocate("client heartbeat".to_string());
        assert!(!set.reader().has_position_counters());
    }
}
