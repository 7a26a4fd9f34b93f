//! Managed heap with mark-and-sweep collection
//!
//! The heap owns every guest object exclusively; nothing outside the
//! collector frees one. Collection is reachability-based — reference
//! cycles are reclaimed without refcounts. Two generations exist: an
//! exempt set (interned constants, type objects, modules — never
//! collected) and the single collectible generation backed by the
//! object pool.

use std::cell::Cell;

use rustc_hash::FxHashSet;

use crate::pool::{Handle, ObjectPool};

/// Minimum collection threshold (live objects). After a sweep the
/// threshold becomes `max(2 * survivors, MIN_THRESHOLD)`.
const MIN_THRESHOLD: usize = 256;

/// Trait for payloads the collector can walk.
///
/// `trace` must report every [`Handle`] the value keeps alive. The
/// destroy half of the per-type vtable is the payload's `Drop` impl,
/// run during sweep.
pub trait Trace {
    /// Report each heap reference held by this value.
    fn trace(&self, mark: &mut dyn FnMut(Handle));
}

/// Collection statistics.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    /// Live objects in the collectible generation plus exempt set
    pub live_objects: usize,
    /// Collections performed so far
    pub collections: usize,
    /// Objects freed by the last collection
    pub last_freed: usize,
    /// Current allocation-count trigger threshold
    pub threshold: usize,
}

/// The managed heap.
pub struct Heap<T: Trace> {
    pool: ObjectPool<T>,
    /// Handles exempt from collection (keyed by slot index; exempt
    /// slots are never recycled, so the index is stable)
    exempt: FxHashSet<u32>,
    /// Allocations since the last collection
    allocs_since_gc: usize,
    threshold: usize,
    collections: usize,
    last_freed: usize,
    /// Nestable scope-lock counter; nonzero suspends collection
    lock_depth: Cell<u32>,
    /// A collection was requested while locked
    pending: Cell<bool>,
}

impl<T: Trace> Heap<T> {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            pool: ObjectPool::new(),
            exempt: FxHashSet::default(),
            allocs_since_gc: 0,
            threshold: MIN_THRESHOLD,
            collections: 0,
            last_freed: 0,
            lock_depth: Cell::new(0),
            pending: Cell::new(false),
        }
    }

    /// Allocate a new object. Never fails short of process OOM.
    pub fn alloc(&mut self, value: T) -> Handle {
        self.allocs_since_gc += 1;
        self.pool.alloc(value)
    }

    /// Borrow an object.
    #[inline]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.pool.get(handle)
    }

    /// Mutably borrow an object.
    #[inline]
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.pool.get_mut(handle)
    }

    /// Check whether `handle` refers to a live object.
    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.pool.contains(handle)
    }

    /// Move an object into the exempt generation. Exempt objects are
    /// never swept and outlive every collection cycle.
    pub fn mark_exempt(&mut self, handle: Handle) {
        debug_assert!(self.pool.contains(handle));
        self.exempt.insert(handle.index);
    }

    /// Number of live objects (collectible + exempt).
    pub fn live_count(&self) -> usize {
        self.pool.live_count()
    }

    /// Whether the allocation counter has crossed the threshold and a
    /// collection should run at the next safe point. Always false
    /// while the scope lock is held.
    pub fn should_collect(&self) -> bool {
        if self.lock_depth.get() > 0 {
            return false;
        }
        self.pending.get() || self.allocs_since_gc >= self.threshold
    }

    /// Enter a no-collection scope. Nestable.
    ///
    /// Used around multi-step constructions that temporarily hold heap
    /// objects outside any root.
    pub fn gc_lock(&self) {
        self.lock_depth.set(self.lock_depth.get() + 1);
    }

    /// Leave a no-collection scope. A collection requested while
    /// locked stays pending and fires at the next safe point.
    pub fn gc_unlock(&self) {
        let depth = self.lock_depth.get();
        debug_assert!(depth > 0, "gc_unlock without matching gc_lock");
        self.lock_depth.set(depth.saturating_sub(1));
    }

    /// Whether the scope lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.lock_depth.get() > 0
    }

    /// Run a full mark-and-sweep collection over `roots`.
    ///
    /// Calling this while the scope lock is held is a programming
    /// error: it asserts in debug builds; in release builds it defers
    /// (sets the pending flag) and returns 0. Returns the number of
    /// objects freed.
    pub fn collect<I>(&mut self, roots: I) -> usize
    where
        I: IntoIterator<Item = Handle>,
    {
        if self.lock_depth.get() > 0 {
            debug_assert!(false, "collect called under the GC scope lock");
            self.pending.set(true);
            return 0;
        }
        self.pending.set(false);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "pyrite::gc",
            live = self.pool.live_count(),
            threshold = self.threshold,
            "GC cycle starting"
        );

        // Mark phase: worklist traversal from the roots.
        let mut marked: FxHashSet<u32> = FxHashSet::default();
        let mut worklist: Vec<Handle> = Vec::new();
        for root in roots {
            if self.pool.contains(root) && marked.insert(root.index) {
                worklist.push(root);
            }
        }
        while let Some(handle) = worklist.pop() {
            if let Some(value) = self.pool.get(handle) {
                value.trace(&mut |child| {
                    if marked.insert(child.index) {
                        worklist.push(child);
                    }
                });
            }
        }

        // Sweep phase: free unmarked, non-exempt objects.
        let mut freed = 0;
        for handle in self.pool.live_handles() {
            if !marked.contains(&handle.index) && !self.exempt.contains(&handle.index) {
                self.pool.dealloc(handle);
                freed += 1;
            }
        }

        // New threshold: roughly twice the surviving population.
        let survivors = self.pool.live_count();
        self.threshold = (survivors * 2).max(MIN_THRESHOLD);
        self.allocs_since_gc = 0;
        self.collections += 1;
        self.last_freed = freed;

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "pyrite::gc",
            collection = self.collections,
            freed,
            survivors,
            next_threshold = self.threshold,
            "GC cycle complete"
        );

        freed
    }

    /// Release empty arenas back to the system allocator.
    pub fn shrink_to_fit(&mut self) -> usize {
        self.pool.shrink_to_fit()
    }

    /// Current statistics.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.pool.live_count(),
            collections: self.collections,
            last_freed: self.last_freed,
            threshold: self.threshold,
        }
    }
}

impl<T: Trace> Default for Heap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test payload holding references to other heap objects.
    struct Node {
        refs: Vec<Handle>,
    }

    impl Node {
        fn leaf() -> Self {
            Self { refs: Vec::new() }
        }
    }

    impl Trace for Node {
        fn trace(&self, mark: &mut dyn FnMut(Handle)) {
            for &r in &self.refs {
                mark(r);
            }
        }
    }

    #[test]
    fn test_collect_unreachable() {
        let mut heap = Heap::new();
        heap.alloc(Node::leaf());
        heap.alloc(Node::leaf());
        assert_eq!(heap.live_count(), 2);

        let freed = heap.collect([]);
        assert_eq!(freed, 2);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_roots_survive_transitively() {
        let mut heap = Heap::new();
        let leaf = heap.alloc(Node::leaf());
        let root = heap.alloc(Node { refs: vec![leaf] });
        heap.alloc(Node::leaf()); // unreachable

        let freed = heap.collect([root]);
        assert_eq!(freed, 1);
        assert!(heap.contains(root));
        assert!(heap.contains(leaf));
    }

    #[test]
    fn test_cycles_collected() {
        let mut heap = Heap::new();
        let a = heap.alloc(Node::leaf());
        let b = heap.alloc(Node { refs: vec![a] });
        heap.get_mut(a).unwrap().refs.push(b);

        // No roots: the two-object cycle must be freed in one cycle.
        let freed = heap.collect([]);
        assert_eq!(freed, 2);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_exempt_objects_never_swept() {
        let mut heap = Heap::new();
        let exempt = heap.alloc(Node::leaf());
        heap.mark_exempt(exempt);

        let freed = heap.collect([]);
        assert_eq!(freed, 0);
        assert!(heap.contains(exempt));
    }

    #[test]
    fn test_threshold_doubles_on_survival() {
        let mut heap = Heap::new();
        let roots: Vec<_> = (0..300).map(|_| heap.alloc(Node::leaf())).collect();
        heap.collect(roots.iter().copied());
        assert_eq!(heap.stats().threshold, 600);

        // With few survivors the floor applies.
        let mut small = Heap::new();
        let keep = small.alloc(Node::leaf());
        small.collect([keep]);
        assert_eq!(small.stats().threshold, MIN_THRESHOLD);
    }

    #[test]
    fn test_scope_lock_defers_collection() {
        let mut heap = Heap::new();
        for _ in 0..MIN_THRESHOLD {
            heap.alloc(Node::leaf());
        }
        assert!(heap.should_collect());

        heap.gc_lock();
        assert!(!heap.should_collect());
        heap.gc_lock(); // nestable
        heap.gc_unlock();
        assert!(!heap.should_collect());
        heap.gc_unlock();

        // Deferred, never dropped.
        assert!(heap.should_collect());
        let freed = heap.collect([]);
        assert_eq!(freed, MIN_THRESHOLD);
    }

    #[test]
    fn test_stats_track_collections() {
        let mut heap = Heap::new();
        heap.alloc(Node::leaf());
        heap.collect([]);
        let stats = heap.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.last_freed, 1);
        assert_eq!(stats.live_objects, 0);
    }
}
