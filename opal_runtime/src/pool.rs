//! Pooled allocator.
//!
//! Two allocation paths: size-classed freelists carved out of bump arenas
//! for small objects, and the global allocator for everything else. The pool
//! keeps an index of every live allocation, which serves three callers: the
//! post-run leak report, the error dumper's pointer probe, and the
//! delayed-delete drain.

use rustc_hash::FxHashMap;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

/// Upper size bound for the freelist path.
pub const SMALL_OBJECT_MAX: usize = 256;

const ALIGN: usize = 16;
const NUM_CLASSES: usize = SMALL_OBJECT_MAX / ALIGN;
const ARENA_SIZE: usize = 64 * 1024;

struct Arena {
    base: NonNull<u8>,
    used: usize,
}

/// The allocator pool. Owned by one heap; not thread-safe.
pub struct Pool {
    arenas: Vec<Arena>,
    freelists: [Vec<NonNull<u8>>; NUM_CLASSES],
    /// Layouts of out-of-arena allocations, keyed by address.
    large: FxHashMap<usize, Layout>,
    /// Every live allocation: address → requested size.
    live: FxHashMap<usize, usize>,
    total_allocated: u64,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            arenas: Vec::new(),
            freelists: std::array::from_fn(|_| Vec::new()),
            large: FxHashMap::default(),
            live: FxHashMap::default(),
            total_allocated: 0,
        }
    }

    #[inline]
    fn class_of(size: usize) -> usize {
        debug_assert!(size > 0 && size <= SMALL_OBJECT_MAX);
        (size + ALIGN - 1) / ALIGN - 1
    }

    /// Allocate a small object from the per-size freelist.
    pub fn alloc_small(&mut self, size: usize) -> NonNull<u8> {
        debug_assert!(size <= SMALL_OBJECT_MAX);
        let cls = Self::class_of(size);
        let p = match self.freelists[cls].pop() {
            Some(p) => p,
            None => self.bump((cls + 1) * ALIGN),
        };
        self.live.insert(p.as_ptr() as usize, size);
        self.total_allocated += 1;
        p
    }

    /// Allocate any size; small sizes take the freelist path.
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        if size <= SMALL_OBJECT_MAX {
            return self.alloc_small(size);
        }
        let layout = Layout::from_size_align(size, ALIGN).expect("oversized allocation");
        // Safety: layout has non-zero size.
        let p = unsafe { alloc(layout) };
        let Some(p) = NonNull::new(p) else {
            handle_alloc_error(layout);
        };
        self.large.insert(p.as_ptr() as usize, layout);
        self.live.insert(p.as_ptr() as usize, size);
        self.total_allocated += 1;
        p
    }

    fn bump(&mut self, rounded: usize) -> NonNull<u8> {
        if let Some(a) = self.arenas.last_mut() {
            if a.used + rounded <= ARENA_SIZE {
                // Safety: offset stays within the arena allocation.
                let p = unsafe { NonNull::new_unchecked(a.base.as_ptr().add(a.used)) };
                a.used += rounded;
                return p;
            }
        }
        let layout = Layout::from_size_align(ARENA_SIZE, ALIGN).expect("arena layout");
        // Safety: layout has non-zero size.
        let base = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout);
        };
        log::debug!("pool: new {} KiB arena ({} total)", ARENA_SIZE / 1024, self.arenas.len() + 1);
        self.arenas.push(Arena { base, used: rounded });
        base
    }

    /// Return an allocation. `size` must be the size it was requested with.
    ///
    /// # Safety
    ///
    /// `p` must be a live allocation of this pool, not used after this call.
    pub unsafe fn dealloc(&mut self, p: NonNull<u8>, size: usize) {
        let addr = p.as_ptr() as usize;
        let recorded = self.live.remove(&addr);
        debug_assert_eq!(recorded, Some(size), "dealloc size mismatch at {:#x}", addr);
        if let Some(layout) = self.large.remove(&addr) {
            // Safety: allocated with exactly this layout above.
            unsafe { dealloc(p.as_ptr(), layout) };
        } else {
            self.freelists[Self::class_of(size)].push(p);
        }
    }

    /// Whether `addr` is the address of a live allocation. Lets the error
    /// dumper probe stack words that may or may not be object references.
    #[inline]
    pub fn pointer_is_in_allocator(&self, addr: usize) -> bool {
        self.live.contains_key(&addr)
    }

    /// All live allocations. Empty for a program that released everything.
    pub fn find_leaks(&self) -> Vec<NonNull<u8>> {
        self.live
            .keys()
            // Safety-free: addresses in `live` were NonNull at insert.
            .filter_map(|&a| NonNull::new(a as *mut u8))
            .collect()
    }

    #[inline]
    pub fn num_live(&self) -> usize {
        self.live.len()
    }

    /// Log allocator statistics.
    pub fn log_stats(&self) {
        log::debug!(
            "pool: {} arenas, {} allocations total, {} live",
            self.arenas.len(),
            self.total_allocated,
            self.live.len()
        );
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(ARENA_SIZE, ALIGN).expect("arena layout");
        for a in &self.arenas {
            // Safety: arenas were allocated with exactly this layout.
            unsafe { dealloc(a.base.as_ptr(), layout) };
        }
        for (&addr, &l) in &self.large {
            // Safety: still-live large allocations were allocated with `l`.
            unsafe { dealloc(addr as *mut u8, l) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_alloc_reuse() {
        let mut pool = Pool::new();
        let a = pool.alloc_small(24);
        unsafe { pool.dealloc(a, 24) };
        let b = pool.alloc_small(20);
        // Same size class, freed slot comes back.
        assert_eq!(a.as_ptr(), b.as_ptr());
        unsafe { pool.dealloc(b, 20) };
        assert_eq!(pool.num_live(), 0);
    }

    #[test]
    fn test_large_alloc() {
        let mut pool = Pool::new();
        let p = pool.alloc(4096);
        assert!(pool.pointer_is_in_allocator(p.as_ptr() as usize));
        unsafe { pool.dealloc(p, 4096) };
        assert!(!pool.pointer_is_in_allocator(p.as_ptr() as usize));
    }

    #[test]
    fn test_find_leaks() {
        let mut pool = Pool::new();
        assert!(pool.find_leaks().is_empty());
        let a = pool.alloc_small(32);
        let b = pool.alloc(1024);
        let mut leaks: Vec<usize> = pool.find_leaks().iter().map(|p| p.as_ptr() as usize).collect();
        leaks.sort();
        let mut expect = vec![a.as_ptr() as usize, b.as_ptr() as usize];
        expect.sort();
        assert_eq!(leaks, expect);
        unsafe {
            pool.dealloc(a, 32);
            pool.dealloc(b, 1024);
        }
        assert!(pool.find_leaks().is_empty());
    }

    #[test]
    fn test_probe_rejects_interior_pointers() {
        let mut pool = Pool::new();
        let p = pool.alloc_small(64);
        assert!(pool.pointer_is_in_allocator(p.as_ptr() as usize));
        assert!(!pool.pointer_is_in_allocator(p.as_ptr() as usize + 8));
        unsafe { pool.dealloc(p, 64) };
    }

    #[test]
    fn test_many_allocations_cross_arenas() {
        let mut pool = Pool::new();
        let ptrs: Vec<_> = (0..10_000).map(|_| pool.alloc_small(48)).collect();
        assert_eq!(pool.num_live(), 10_000);
        for p in ptrs {
            unsafe { pool.dealloc(p, 48) };
        }
        assert_eq!(pool.num_live(), 0);
    }
}
