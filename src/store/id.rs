use parking_lot::Mutex;

/// Record id spaces the master hands out in batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdType {
    Node,
    Relationship,
    Property,
    PropertyIndex,
    RelationshipType,
    StringBlock,
    ArrayBlock,
}

/// Thread-safe id allocator with a free list for reuse.
///
/// Freed ids are preferred over fresh ones; `defrag_count` reports how many
/// reusable ids are currently available.
#[derive(Debug, Default)]
pub struct IdGenerator {
    inner: Mutex<IdState>,
}

#[derive(Debug, Default)]
struct IdState {
    high: u64,
    free: Vec<u64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let mut state = self.inner.lock();
        if let Some(id) = state.free.pop() {
            return id;
        }
        let id = state.high;
        state.high += 1;
        id
    }

    /// Reserves `count` consecutive calls worth of ids atomically.
    pub fn next_id_batch(&self, count: usize) -> Vec<u64> {
        let mut state = self.inner.lock();
        let mut ids = Vec::with_capacity(count);
        while ids.len() < count {
            if let Some(id) = state.free.pop() {
                ids.push(id);
            } else {
                let id = state.high;
                state.high += 1;
                ids.push(id);
            }
        }
        ids
    }

    pub fn free_id(&self, id: u64) {
        self.inner.lock().free.push(id);
    }

    pub fn high_id(&self) -> u64 {
        self.inner.lock().high
    }

    /// Raises the high water mark, never lowers it. Used when recovery or a
    /// foreign transaction materializes ids this generator never handed out.
    pub fn set_high_id(&self, high: u64) {
        let mut state = self.inner.lock();
        if high > state.high {
            state.high = high;
        }
    }

    pub fn defrag_count(&self) -> u64 {
        self.inner.lock().free.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_ids_are_reused_first() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
        ids.free_id(0);
        assert_eq!(ids.defrag_count(), 1);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn batch_allocation_is_disjoint() {
        let ids = IdGenerator::new();
        ids.free_id(7);
        ids.set_high_id(10);
        let first = ids.next_id_batch(4);
        let second = ids.next_id_batch(4);
        for id in &first {
            assert!(!second.contains(id));
        }
        assert_eq!(first[0], 7);
    }

    #[test]
    fn high_id_never_lowers() {
        let ids = IdGenerator::new();
        ids.set_high_id(5);
        ids.set_high_id(3);
        assert_eq!(ids.high_id(), 5);
    }
}
