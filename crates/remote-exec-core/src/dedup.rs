//! Bounded window of recently seen event ids.

use std::collections::{HashSet, VecDeque};

/// Default window size.
pub const DEFAULT_DEDUP_CAPACITY: usize = 5000;

/// FIFO-evicting set of event ids.
///
/// An id is reported as a duplicate only while it is inside the window;
/// the window size is a tuning knob, not a delivery guarantee.
#[derive(Debug)]
pub struct RecentIds {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl RecentIds {
    /// Create a window holding at most `capacity` ids (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `id`. Returns `true` if it was not already in the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    /// Whether `id` is currently in the window.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_repeat_inside_window() {
        let mut ids = RecentIds::default();
        assert!(ids.insert("a"));
        assert!(!ids.insert("a"));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut ids = RecentIds::new(3);
        for id in ["a", "b", "c", "d"] {
            assert!(ids.insert(id));
        }
        assert!(!ids.contains("a"));
        assert!(ids.contains("b"));
        assert_eq!(ids.len(), 3);
        // "a" fell out of the window, so it is new again.
        assert!(ids.insert("a"));
        assert!(!ids.contains("b"));
    }

    #[test]
    fn test_default_capacity_holds_5000() {
        let mut ids = RecentIds::default();
        for i in 0..DEFAULT_DEDUP_CAPACITY {
            ids.insert(&i.to_string());
        }
        assert!(ids.contains("0"));
        ids.insert("overflow");
        assert!(!ids.contains("0"));
        assert!(ids.contains("1"));
    }
}
