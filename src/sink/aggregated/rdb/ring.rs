/// Number of recently created row keys remembered.
pub const INSERT_SUPPRESSION_SLOTS: usize = 64;

/// Fixed-size ring of row keys known to exist in the data table.
///
/// A hit means the insert-if-absent statement for the key can be skipped.
/// Keys are only added after their creation succeeded and rows are never
/// deleted, so a hit is always correct; eviction only costs one redundant
/// idempotent insert.
#[derive(Debug, Clone)]
pub struct InsertSuppressionRing<K> {
    slots: Vec<Option<K>>,
    next: usize,
}

impl<K: PartialEq> InsertSuppressionRing<K> {
    /// Creates an empty ring with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(1));
        slots.resize_with(capacity.max(1), || None);
        Self { slots, next: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the key is currently remembered.
    pub fn contains(&self, key: &K) -> bool {
        self.slots.iter().any(|slot| slot.as_ref() == Some(key))
    }

    /// Remembers a key in the next slot, overwriting the oldest on wrap-around.
    pub fn insert(&mut self, key: K) {
        if self.contains(&key) {
            return;
        }

        self.slots[self.next] = Some(key);
        self.next = (self.next + 1) % self.slots.len();
    }
}

impl<K: PartialEq> Default for InsertSuppressionRing<K> {
    fn default() -> Self {
        Self::new(INSERT_SUPPRESSION_SLOTS)
    }
}
