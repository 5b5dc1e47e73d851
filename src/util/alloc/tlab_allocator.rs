//! The multi-chunk TLAB allocator.
//!
//! Mutators obtain thread-local allocation buffers here without blocking:
//! the fast path carves a span off the current chunk with a single CAS. When
//! the chunk is exhausted, the slow path (serialized by the underlying
//! allocator's refill lock) hands the leftover to the refill manager, which
//! either installs a fresh contiguous chunk to retry against, or directly
//! returns a linked list of free-chunk-formatted spans: a multi-chunk TLAB.
//! Either way the span handed back to the mutator carries the heap free
//! chunk format, so the owning thread (and a heap walk) can parse it;
//! a single-chunk TLAB is simply a free chunk whose `next` is null.

use crate::util::alloc::linear_allocator::LinearAllocator;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::heap::free_chunk::HeapFreeChunk;
use crate::util::Address;

/// What a TLAB refill produced.
pub enum TlabRefill {
    /// A fresh contiguous chunk was produced for the allocator to install as
    /// its current range; the requesting thread retries the fast path.
    Refilled(HeapFreeChunk),
    /// The chunk list is the TLAB itself, handed to the mutator as is.
    ChunkList(HeapFreeChunk),
    /// No space could be produced; the caller must request a GC.
    Exhausted,
}

/// Supplies TLAB space when the current chunk is exhausted.
pub trait TlabRefillManager: Send + Sync {
    /// Called under the refill lock with the leftover of the exhausted chunk,
    /// which the manager now owns: it must format it as a free chunk if it is
    /// at least the minimum chunk size, and as dead space otherwise.
    fn refill_tlab(
        &self,
        requested: usize,
        leftover_start: Address,
        leftover_size: usize,
    ) -> TlabRefill;
}

/// Non-blocking per-thread allocation of single chunks or chunk-list TLABs.
pub struct MultiChunkTlabAllocator {
    linear: LinearAllocator,
}

impl MultiChunkTlabAllocator {
    /// An allocator with no current chunk; the first request goes straight
    /// to the refill manager.
    pub fn new_unbacked() -> MultiChunkTlabAllocator {
        MultiChunkTlabAllocator {
            linear: LinearAllocator::new_unbacked(0),
        }
    }

    pub fn new(start: Address, size: usize) -> MultiChunkTlabAllocator {
        MultiChunkTlabAllocator {
            linear: LinearAllocator::new(start, size, 0),
        }
    }

    /// The underlying linear range, for inspection.
    pub fn linear(&self) -> &LinearAllocator {
        &self.linear
    }

    /// Allocate a TLAB of at least `requested` bytes. The returned span is
    /// free-chunk formatted. Returns `None` only on heap exhaustion.
    pub fn allocate_tlab(
        &self,
        requested: usize,
        refill: &dyn TlabRefillManager,
    ) -> Option<Address> {
        debug_assert!(requested % BYTES_IN_WORD == 0);
        loop {
            // Fast path: a single CAS against the current chunk.
            let old_top = self.linear.top();
            let new_top = old_top + requested;
            if new_top <= self.linear.end() {
                if self.linear.try_bump(old_top, new_top) {
                    HeapFreeChunk::format(old_top, requested, unsafe { Address::zero() });
                    return Some(old_top);
                }
                continue;
            }
            // Slow path, under the refill lock.
            match self.allocate_tlab_slow(requested, refill) {
                SlowPathOutcome::Retry => continue,
                SlowPathOutcome::Tlab(addr) => return Some(addr),
                SlowPathOutcome::Exhausted => return None,
            }
        }
    }

    fn allocate_tlab_slow(
        &self,
        requested: usize,
        refill: &dyn TlabRefillManager,
    ) -> SlowPathOutcome {
        self.linear.with_refill_lock(|| {
            // Re-check: another thread may have refilled while we waited.
            let top = self.linear.top();
            if top + requested <= self.linear.end() {
                return SlowPathOutcome::Retry;
            }
            let old_top = self.linear.park_top();
            let hard_limit = self.linear.hard_limit();
            let leftover = if hard_limit > old_top {
                hard_limit - old_top
            } else {
                0
            };
            match refill.refill_tlab(requested, old_top, leftover) {
                TlabRefill::Refilled(chunk) => {
                    debug_assert!(!chunk.is_zero());
                    let size = chunk.size();
                    self.linear.refill(chunk.to_address(), size);
                    SlowPathOutcome::Retry
                }
                TlabRefill::ChunkList(head) => {
                    debug_assert!(!head.is_zero());
                    SlowPathOutcome::Tlab(head.to_address())
                }
                TlabRefill::Exhausted => SlowPathOutcome::Exhausted,
            }
        })
    }
}

enum SlowPathOutcome {
    Retry,
    Tlab(Address),
    Exhausted,
}
