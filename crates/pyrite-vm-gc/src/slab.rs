//! Fixed-size transient pool
//!
//! A free-list slab for short-lived records allocated and released at
//! high frequency — call frames, most prominently. Allocation and
//! deallocation are O(1) index push/pop; exceeding the initial
//! capacity falls back to growing the slab (the direct-allocation
//! path of the original design).

/// A slab pool handing out `u32` slot indices.
pub struct SlabPool<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> SlabPool<T> {
    /// Create a pool with `capacity` pre-sized slots.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(None);
            free.push((capacity - 1 - i) as u32);
        }
        Self { slots, free }
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Store `value`, returning its slot index.
    pub fn alloc(&mut self, value: T) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(value);
                idx
            }
            None => {
                // Overflow: grow the slab.
                self.slots.push(Some(value));
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Remove and return the entry at `idx`.
    ///
    /// # Panics
    /// Panics if the slot is empty — freeing a slot twice is a
    /// programming error, not a recoverable condition.
    pub fn dealloc(&mut self, idx: u32) -> T {
        let value = self.slots[idx as usize]
            .take()
            .expect("slab slot freed twice");
        self.free.push(idx);
        value
    }

    /// Borrow the entry at `idx`.
    #[inline]
    pub fn get(&self, idx: u32) -> Option<&T> {
        self.slots.get(idx as usize)?.as_ref()
    }

    /// Mutably borrow the entry at `idx`.
    #[inline]
    pub fn get_mut(&mut self, idx: u32) -> Option<&mut T> {
        self.slots.get_mut(idx as usize)?.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_dealloc_reuses_slots() {
        let mut pool = SlabPool::with_capacity(2);
        let a = pool.alloc("a");
        let b = pool.alloc("b");
        assert_eq!(pool.live_count(), 2);

        assert_eq!(pool.dealloc(a), "a");
        let c = pool.alloc("c");
        assert_eq!(c, a); // slot reused
        assert_eq!(pool.get(b), Some(&"b"));
        assert_eq!(pool.get(c), Some(&"c"));
    }

    #[test]
    fn test_overflow_grows() {
        let mut pool = SlabPool::with_capacity(1);
        let a = pool.alloc(1);
        let b = pool.alloc(2);
        assert_ne!(a, b);
        assert_eq!(pool.live_count(), 2);
    }

    #[test]
    #[should_panic(expected = "slab slot freed twice")]
    fn test_double_free_panics() {
        let mut pool = SlabPool::with_capacity(1);
        let a = pool.alloc(1);
        pool.dealloc(a);
        pool.dealloc(a);
    }
}
