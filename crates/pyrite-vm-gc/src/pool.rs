//! Arena/block object pool
//!
//! Memory is organized into arenas, each holding a fixed number of
//! slots. Each arena keeps its own free list; arenas with no free slot
//! leave the "available" list, and arenas whose live count returns to
//! zero are eligible for release via [`ObjectPool::shrink_to_fit`].
//!
//! Objects are addressed by [`Handle`] — an arena-slot index paired
//! with a slot generation — rather than raw pointers. A handle into a
//! slot that has since been freed fails the generation check, so
//! use-after-free and double-free degrade into a detectable `None`.

/// Slots per arena. Chosen so an arena of common small objects stays
/// within a few kilobytes.
pub const SLOTS_PER_ARENA: usize = 64;

/// A generational handle to a pooled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    /// Global slot index: `arena * SLOTS_PER_ARENA + slot`
    pub index: u32,
    /// Generation of the slot at allocation time
    pub generation: u32,
}

impl Handle {
    #[inline]
    fn arena(self) -> usize {
        self.index as usize / SLOTS_PER_ARENA
    }

    #[inline]
    fn slot(self) -> usize {
        self.index as usize % SLOTS_PER_ARENA
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    /// Stack of free slot indices within this arena
    free: Vec<u16>,
    /// First generation to hand out if the arena is re-inflated after
    /// a shrink (keeps stale handles stale)
    next_generation: u32,
}

impl<T> Arena<T> {
    fn new(next_generation: u32) -> Self {
        let mut slots = Vec::with_capacity(SLOTS_PER_ARENA);
        let mut free = Vec::with_capacity(SLOTS_PER_ARENA);
        for i in 0..SLOTS_PER_ARENA {
            slots.push(Slot {
                value: None,
                generation: next_generation,
            });
            free.push((SLOTS_PER_ARENA - 1 - i) as u16);
        }
        Self {
            slots,
            free,
            next_generation,
        }
    }

    #[inline]
    fn live_count(&self) -> usize {
        if self.slots.is_empty() {
            0 // released by shrink_to_fit
        } else {
            SLOTS_PER_ARENA - self.free.len()
        }
    }

    #[inline]
    fn is_released(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop slot storage. Only valid when no slot is live.
    fn release(&mut self) {
        debug_assert_eq!(self.live_count(), 0);
        // Remember the highest generation so re-inflation cannot
        // revalidate a stale handle.
        let max_gen = self
            .slots
            .iter()
            .map(|s| s.generation)
            .max()
            .unwrap_or(self.next_generation);
        self.next_generation = max_gen.wrapping_add(1);
        self.slots = Vec::new();
        self.free = Vec::new();
    }

    fn reinflate(&mut self) {
        debug_assert!(self.is_released());
        let base = self.next_generation;
        for i in 0..SLOTS_PER_ARENA {
            self.slots.push(Slot {
                value: None,
                generation: base,
            });
            self.free.push((SLOTS_PER_ARENA - 1 - i) as u16);
        }
    }
}

/// An arena-based pool of objects of type `T`.
pub struct ObjectPool<T> {
    arenas: Vec<Arena<T>>,
    /// Indices of arenas with at least one free slot
    available: Vec<u32>,
    live: usize,
}

impl<T> ObjectPool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            arenas: Vec::new(),
            available: Vec::new(),
            live: 0,
        }
    }

    /// Number of live objects in the pool.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of arenas currently holding slot storage.
    pub fn arena_count(&self) -> usize {
        self.arenas.iter().filter(|a| !a.is_released()).count()
    }

    /// Allocate a slot for `value`. Never fails: a new arena is
    /// appended when no free slot exists (the process aborts only on
    /// true OOM inside the global allocator).
    pub fn alloc(&mut self, value: T) -> Handle {
        let arena_idx = match self.available.last() {
            Some(&idx) => idx as usize,
            None => {
                // Reuse a released arena before appending a new one.
                if let Some(idx) = self.arenas.iter().position(|a| a.is_released()) {
                    self.arenas[idx].reinflate();
                    self.available.push(idx as u32);
                    idx
                } else {
                    self.arenas.push(Arena::new(0));
                    let idx = self.arenas.len() - 1;
                    self.available.push(idx as u32);
                    idx
                }
            }
        };

        let arena = &mut self.arenas[arena_idx];
        let slot_idx = arena.free.pop().expect("available arena had no free slot") as usize;
        let slot = &mut arena.slots[slot_idx];
        debug_assert!(slot.value.is_none());
        slot.value = Some(value);
        let generation = slot.generation;

        if arena.free.is_empty() {
            // Arena is now full; drop it from the available list.
            self.available.retain(|&i| i as usize != arena_idx);
        }
        self.live += 1;

        Handle {
            index: (arena_idx * SLOTS_PER_ARENA + slot_idx) as u32,
            generation,
        }
    }

    /// Free the object behind `handle`, returning it. A stale or
    /// already-freed handle returns `None` — deallocation never
    /// touches foreign memory.
    pub fn dealloc(&mut self, handle: Handle) -> Option<T> {
        let arena_idx = handle.arena();
        let arena = self.arenas.get_mut(arena_idx)?;
        if arena.is_released() {
            return None;
        }
        let slot = &mut arena.slots[handle.slot()];
        if slot.generation != handle.generation || slot.value.is_none() {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);

        let was_full = arena.free.is_empty();
        arena.free.push(handle.slot() as u16);
        if was_full {
            self.available.push(arena_idx as u32);
        }
        self.live -= 1;
        value
    }

    /// Borrow the object behind `handle`.
    #[inline]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        let arena = self.arenas.get(handle.arena())?;
        if arena.is_released() {
            return None;
        }
        let slot = &arena.slots[handle.slot()];
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Mutably borrow the object behind `handle`.
    #[inline]
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let arena = self.arenas.get_mut(handle.arena())?;
        if arena.is_released() {
            return None;
        }
        let slot = &mut arena.slots[handle.slot()];
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Check whether `handle` refers to a live object.
    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Collect the handles of all live objects.
    pub fn live_handles(&self) -> Vec<Handle> {
        let mut out = Vec::with_capacity(self.live);
        for (arena_idx, arena) in self.arenas.iter().enumerate() {
            for (slot_idx, slot) in arena.slots.iter().enumerate() {
                if slot.value.is_some() {
                    out.push(Handle {
                        index: (arena_idx * SLOTS_PER_ARENA + slot_idx) as u32,
                        generation: slot.generation,
                    });
                }
            }
        }
        out
    }

    /// Release the slot storage of every arena with no live object.
    /// Never frees an arena with a slot still in use.
    pub fn shrink_to_fit(&mut self) -> usize {
        let mut released = 0;
        for (idx, arena) in self.arenas.iter_mut().enumerate() {
            if !arena.is_released() && arena.live_count() == 0 {
                arena.release();
                self.available.retain(|&i| i as usize != idx);
                released += 1;
            }
        }
        released
    }
}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_get_dealloc() {
        let mut pool = ObjectPool::new();
        let h = pool.alloc(42i32);
        assert_eq!(pool.get(h), Some(&42));
        assert_eq!(pool.live_count(), 1);

        assert_eq!(pool.dealloc(h), Some(42));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.get(h), None);
    }

    #[test]
    fn test_double_free_detected() {
        let mut pool = ObjectPool::new();
        let h = pool.alloc(1i32);
        assert_eq!(pool.dealloc(h), Some(1));
        assert_eq!(pool.dealloc(h), None);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut pool = ObjectPool::new();
        let h1 = pool.alloc(1i32);
        pool.dealloc(h1);
        let h2 = pool.alloc(2i32);
        // Same slot, different generation
        assert_eq!(h1.index, h2.index);
        assert_eq!(pool.get(h1), None);
        assert_eq!(pool.get(h2), Some(&2));
    }

    #[test]
    fn test_accounting_tracks_net() {
        let mut pool = ObjectPool::new();
        let handles: Vec<_> = (0..100).map(|i| pool.alloc(i)).collect();
        assert_eq!(pool.live_count(), 100);
        for h in &handles[..40] {
            pool.dealloc(*h);
        }
        assert_eq!(pool.live_count(), 60);
    }

    #[test]
    fn test_arena_overflow_appends() {
        let mut pool = ObjectPool::new();
        let n = SLOTS_PER_ARENA * 2 + 3;
        let handles: Vec<_> = (0..n).map(|i| pool.alloc(i)).collect();
        assert_eq!(pool.live_count(), n);
        assert_eq!(pool.arena_count(), 3);
        for h in handles {
            assert!(pool.contains(h));
        }
    }

    #[test]
    fn test_shrink_never_frees_live_arena() {
        let mut pool = ObjectPool::new();
        let handles: Vec<_> = (0..SLOTS_PER_ARENA * 2).map(|i| pool.alloc(i)).collect();

        // Empty the second arena entirely, keep one live in the first.
        for h in &handles[SLOTS_PER_ARENA..] {
            pool.dealloc(*h);
        }
        for h in &handles[1..SLOTS_PER_ARENA] {
            pool.dealloc(*h);
        }

        let released = pool.shrink_to_fit();
        assert_eq!(released, 1);
        assert_eq!(pool.get(handles[0]), Some(&0));
    }

    #[test]
    fn test_reinflated_arena_rejects_stale_handles() {
        let mut pool: ObjectPool<i32> = ObjectPool::new();
        let old: Vec<_> = (0..SLOTS_PER_ARENA).map(|i| pool.alloc(i as i32)).collect();
        for h in &old {
            pool.dealloc(*h);
        }
        pool.shrink_to_fit();

        // Allocation reuses the released arena.
        let fresh = pool.alloc(7);
        assert_eq!(pool.get(fresh), Some(&7));
        for h in &old {
            assert_eq!(pool.get(*h), None);
        }
    }

    #[test]
    fn test_live_handles() {
        let mut pool = ObjectPool::new();
        let a = pool.alloc(1);
        let b = pool.alloc(2);
        pool.dealloc(a);
        let live = pool.live_handles();
        assert_eq!(live, vec![b]);
    }
}
