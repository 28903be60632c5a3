use std::collections::{HashSet, VecDeque};

pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// Bounded set of processed event ids.
///
/// Eviction is strictly first-in first-out: marking an id that is already
/// present does not refresh its position.
#[derive(Debug)]
pub struct SeenCache {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn seen(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn mark(&mut self, id: &str) {
        if self.ids.contains(id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
    }

    /// Returns `true` if the id was already present; marks it otherwise.
    pub fn check_and_mark(&mut self, id: &str) -> bool {
        if self.seen(id) {
            return true;
        }
        self.mark(id);
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_and_mark() {
        let mut cache = SeenCache::new(4);
        assert!(!cache.check_and_mark("a"));
        assert!(cache.check_and_mark("a"));
        assert!(cache.seen("a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut cache = SeenCache::new(3);
        for id in ["a", "b", "c", "d"] {
            cache.mark(id);
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.seen("a"));
        assert!(cache.seen("b"));
        assert!(cache.seen("d"));
    }

    #[test]
    fn test_remark_does_not_refresh_position() {
        let mut cache = SeenCache::new(2);
        cache.mark("a");
        cache.mark("b");
        cache.mark("a");
        cache.mark("c");
        assert!(!cache.seen("a"));
        assert!(cache.seen("b"));
        assert!(cache.seen("c"));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut cache = SeenCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.mark("a");
        cache.mark("b");
        assert!(!cache.seen("a"));
        assert!(cache.seen("b"));
    }
}
