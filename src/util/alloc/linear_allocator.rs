//! The linear bump allocator.
//!
//! Hands out word-aligned cells by bumping an atomically updated `top`
//! pointer over a contiguous range. The range is described by four cursors
//! with `start <= top <= end <= hard_limit`; `end` trails `hard_limit` by a
//! fixed headroom so a refill manager always has room to format the leftover
//! as a parsable free chunk. When a request does not fit, the allocator
//! delegates to its refill manager, which may install a fresh range or give
//! up, in which case the allocation returns `None` and the caller is
//! expected to request a GC.

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use atomic::Atomic;

use crate::util::constants::BYTES_IN_WORD;
use crate::util::heap::free_chunk::HeapFreeChunk;
use crate::util::Address;

/// Bytes consumed in front of every cell by the debug tag.
#[cfg(feature = "heap_debug_tags")]
pub const DEBUG_TAG_BYTES: usize = BYTES_IN_WORD;
#[cfg(not(feature = "heap_debug_tags"))]
pub const DEBUG_TAG_BYTES: usize = 0;

/// Tag word planted in front of every cell when `heap_debug_tags` is on.
#[cfg(feature = "heap_debug_tags")]
pub const DEBUG_TAG_MARK: usize = 0xA110_CA7E_A110_CA7E_u64 as usize;

/// Supplies a fresh linear range when the current one is exhausted.
pub trait RefillManager: Send + Sync {
    /// Called, serialized under the allocator's refill lock, when `requested`
    /// bytes do not fit in the current range. `top` and `space_left` describe
    /// the leftover of the exhausted range, which the manager now owns: it
    /// must make it parsable (free chunk or dead space) before returning.
    ///
    /// Returns a free-chunk-formatted span to install as the new range, or
    /// `None` if no space can be produced, which propagates as an allocation
    /// failure.
    fn allocate_refill(
        &self,
        requested: usize,
        top: Address,
        space_left: usize,
    ) -> Option<HeapFreeChunk>;
}

/// A linear range with an atomically bumped allocation cursor.
pub struct LinearAllocator {
    start: Atomic<Address>,
    top: Atomic<Address>,
    end: Atomic<Address>,
    hard_limit: Atomic<Address>,
    headroom: usize,
    /// Serializes refills; the bump path never takes it.
    refill_lock: Mutex<()>,
}

impl LinearAllocator {
    /// Create an unbacked allocator. Every allocation fails until
    /// [`Self::refill`] installs a range.
    pub fn new_unbacked(headroom: usize) -> LinearAllocator {
        let zero = unsafe { Address::zero() };
        LinearAllocator {
            start: Atomic::new(zero),
            top: Atomic::new(zero),
            end: Atomic::new(zero),
            hard_limit: Atomic::new(zero),
            headroom,
            refill_lock: Mutex::new(()),
        }
    }

    /// Create an allocator over `[start, start + size)`.
    pub fn new(start: Address, size: usize, headroom: usize) -> LinearAllocator {
        let allocator = Self::new_unbacked(headroom);
        allocator.refill(start, size);
        allocator
    }

    /// Install a fresh range. The previous range, if any, is abandoned; the
    /// caller is responsible for having made its leftover parsable.
    pub fn refill(&self, start: Address, size: usize) {
        debug_assert!(start.is_aligned_to(BYTES_IN_WORD));
        debug_assert!(size >= self.headroom);
        self.start.store(start, Ordering::Relaxed);
        self.hard_limit.store(start + size, Ordering::Relaxed);
        self.end
            .store(start + size - self.headroom, Ordering::Relaxed);
        // Publish top last: a racing bump retries against the new range.
        self.top.store(start, Ordering::Release);
    }

    pub fn start(&self) -> Address {
        self.start.load(Ordering::Relaxed)
    }

    pub fn top(&self) -> Address {
        self.top.load(Ordering::Relaxed)
    }

    pub fn end(&self) -> Address {
        self.end.load(Ordering::Relaxed)
    }

    pub fn hard_limit(&self) -> Address {
        self.hard_limit.load(Ordering::Relaxed)
    }

    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// The actual number of bytes an allocation of `size` consumes,
    /// including the debug tag when it is compiled in.
    pub fn allocation_size(size: usize) -> usize {
        crate::util::conversions::raw_align_up(size, BYTES_IN_WORD) + DEBUG_TAG_BYTES
    }

    /// Allocate `size` bytes. `size` must be a multiple of the word size.
    /// Returns `None` when the range is exhausted and the refill manager
    /// cannot produce a new one.
    pub fn allocate(&self, size: usize, refill: &dyn RefillManager) -> Option<Address> {
        debug_assert!(size % BYTES_IN_WORD == 0);
        let needed = Self::allocation_size(size);
        loop {
            let old_top = self.top.load(Ordering::Relaxed);
            let new_top = old_top + needed;
            if new_top > self.end.load(Ordering::Relaxed) {
                if !self.refill_or_wait(needed, refill) {
                    return None;
                }
                continue;
            }
            if self
                .top
                .compare_exchange(old_top, new_top, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(self.finish_cell(old_top));
            }
        }
    }

    /// Plant the debug tag (when compiled in) and return the cell address.
    fn finish_cell(&self, alloc_start: Address) -> Address {
        #[cfg(feature = "heap_debug_tags")]
        unsafe {
            alloc_start.store::<usize>(DEBUG_TAG_MARK);
        }
        alloc_start + DEBUG_TAG_BYTES
    }

    /// Slow path: take the refill lock, re-check, and if the range is still
    /// exhausted ask the refill manager for a new one. Returns false when no
    /// new range could be installed.
    fn refill_or_wait(&self, needed: usize, refill: &dyn RefillManager) -> bool {
        let _guard = self.refill_lock.lock().unwrap();
        let top = self.top.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Relaxed);
        if top + needed <= end {
            // Someone else refilled while we waited for the lock.
            return true;
        }
        // Park the cursor at the hard limit so concurrent bumps keep failing
        // into this slow path while the range is being swapped.
        let hard_limit = self.hard_limit.load(Ordering::Relaxed);
        self.top.store(hard_limit, Ordering::Relaxed);
        let space_left = if hard_limit > top { hard_limit - top } else { 0 };
        match refill.allocate_refill(needed, top, space_left) {
            Some(chunk) => {
                debug_assert!(!chunk.is_zero());
                let size = chunk.size();
                self.refill(chunk.to_address(), size);
                true
            }
            None => false,
        }
    }

    /// Try to move `top` from `old` to `new`. Used by the TLAB allocator,
    /// which carves raw spans rather than cells.
    pub(crate) fn try_bump(&self, old: Address, new: Address) -> bool {
        self.top
            .compare_exchange(old, new, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Park `top` at the hard limit so concurrent bumps fail into the slow
    /// path, and return the previous value. Callers must hold the refill
    /// lock and take ownership of the leftover `[old_top, hard_limit)`.
    pub(crate) fn park_top(&self) -> Address {
        let hard_limit = self.hard_limit.load(Ordering::Relaxed);
        self.top.swap(hard_limit, Ordering::Relaxed)
    }

    /// Run `f` under the refill lock.
    pub(crate) fn with_refill_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.refill_lock.lock().unwrap();
        f()
    }

    /// Compress the allocator's declared range to exactly what has been
    /// handed out. No further allocation can succeed until the next refill.
    pub fn trim(&self) {
        let _guard = self.refill_lock.lock().unwrap();
        let top = self.top.load(Ordering::Relaxed);
        self.end.store(top, Ordering::Relaxed);
        self.hard_limit.store(top, Ordering::Relaxed);
    }

    /// Bytes still available before the next refill.
    pub fn remaining(&self) -> usize {
        let top = self.top.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Relaxed);
        if end > top {
            end - top
        } else {
            0
        }
    }
}

/// A refill manager that never refills. Used while bootstrapping the region
/// manager, where running past the initial committed span is a fatal setup
/// error surfaced as an allocation failure.
pub struct NeverRefill;

impl RefillManager for NeverRefill {
    fn allocate_refill(&self, _: usize, _: Address, _: usize) -> Option<HeapFreeChunk> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(words: usize) -> (Vec<usize>, Address) {
        let buf = vec![0usize; words];
        let base = Address::from_ptr(buf.as_ptr());
        (buf, base)
    }

    #[test]
    fn bump_advances_top() {
        let (_buf, base) = backing(64);
        let la = LinearAllocator::new(base, 64 * BYTES_IN_WORD, 0);
        let a = la.allocate(16, &NeverRefill).unwrap();
        let b = la.allocate(24, &NeverRefill).unwrap();
        assert_eq!(a + LinearAllocator::allocation_size(16), b);
        assert!(la.top() > la.start());
        assert!(la.top() <= la.end());
    }

    #[test]
    fn exhaustion_returns_none() {
        let (_buf, base) = backing(8);
        let la = LinearAllocator::new(base, 8 * BYTES_IN_WORD, 0);
        assert!(la.allocate(8 * BYTES_IN_WORD, &NeverRefill).is_some());
        assert!(la.allocate(BYTES_IN_WORD, &NeverRefill).is_none());
    }

    #[test]
    fn headroom_is_respected() {
        let (_buf, base) = backing(16);
        let la = LinearAllocator::new(base, 16 * BYTES_IN_WORD, 4 * BYTES_IN_WORD);
        assert_eq!(la.end(), la.hard_limit().sub(4 * BYTES_IN_WORD));
        // The headroom is never handed out by the bump path.
        assert!(la.allocate(12 * BYTES_IN_WORD, &NeverRefill).is_some());
        assert_eq!(la.remaining(), 0);
        // A request that would fit in the hard limit but not in end fails.
        assert!(la.allocate(BYTES_IN_WORD, &NeverRefill).is_none());
    }

    #[test]
    fn trim_prevents_further_allocation() {
        let (_buf, base) = backing(32);
        let la = LinearAllocator::new(base, 32 * BYTES_IN_WORD, 0);
        la.allocate(16, &NeverRefill).unwrap();
        la.trim();
        assert_eq!(la.end(), la.top());
        assert!(la.allocate(8, &NeverRefill).is_none());
    }

    struct OneShotRefill {
        span: std::sync::Mutex<Option<(Address, usize)>>,
    }

    impl RefillManager for OneShotRefill {
        fn allocate_refill(&self, _: usize, _: Address, _: usize) -> Option<HeapFreeChunk> {
            let (addr, size) = self.span.lock().unwrap().take()?;
            Some(HeapFreeChunk::format(addr, size, unsafe { Address::zero() }))
        }
    }

    #[test]
    fn refill_installs_new_range() {
        let (_a, base_a) = backing(8);
        let (_b, base_b) = backing(32);
        let la = LinearAllocator::new(base_a, 8 * BYTES_IN_WORD, 0);
        let refill = OneShotRefill {
            span: std::sync::Mutex::new(Some((base_b, 32 * BYTES_IN_WORD))),
        };
        la.allocate(6 * BYTES_IN_WORD, &refill).unwrap();
        // Does not fit in the first range; the refill takes over.
        let cell = la.allocate(16 * BYTES_IN_WORD, &refill).unwrap();
        assert_eq!(cell, base_b + DEBUG_TAG_BYTES);
        assert_eq!(la.start(), base_b);
    }
}
