//! The region-based heap client.
//!
//! A `RegionHeap` owns one heap account and draws regions from it on demand.
//! Objects are carved from a shared CAS-bump linear allocator; TLABs come
//! from the multi-chunk TLAB allocator. Both refill from the same two
//! sources, in order: first-fit over the per-region free-chunk lists the
//! sweeper maintains, then a fresh region from the account. When neither
//! works the allocation returns `None` and the caller is expected to
//! request a collection.
//!
//! After marking, the sweeper hands reclaimed gaps back here and they are
//! re-chunked region by region: spans crossing into regions the heap does
//! not own (or that are not committed) are clipped, and the unallocated
//! tails of the two allocators are left alone.

use std::sync::Arc;
use std::sync::Mutex;

use crate::util::alloc::linear_allocator::{LinearAllocator, RefillManager};
use crate::util::alloc::tlab_allocator::{MultiChunkTlabAllocator, TlabRefill, TlabRefillManager};
use crate::util::constants::{BYTES_IN_WORD, MIN_CELL_SIZE};
use crate::util::conversions::raw_align_up;
use crate::util::heap::account::{HeapAccount, RegionList};
use crate::util::heap::free_chunk::{self, HeapFreeChunk, HEADER_BYTES};
use crate::util::heap::region::LinkSet;
use crate::util::heap::region_manager::RegionManager;
use crate::util::options::Options;
use crate::util::Address;
use crate::vm::{Runtime, Sweeper};

/// A heap client backed by a heap account.
pub struct RegionHeap {
    manager: Arc<RegionManager>,
    account: HeapAccount,
    /// The heap's regions in allocation order (ownership links), plus all
    /// free-chunk list manipulation, under one lock.
    regions: Mutex<RegionList>,
    linear: LinearAllocator,
    tlab: MultiChunkTlabAllocator,
    tlab_min_chunk: usize,
    min_cell_size: usize,
    covered_start: Address,
    covered_end: Address,
}

impl RegionHeap {
    /// Create a heap drawing at most `max_heap_bytes` from the manager's
    /// unreserved pool. Fails when the pool cannot cover the request.
    pub fn new(
        manager: Arc<RegionManager>,
        options: &Options,
        max_heap_bytes: usize,
    ) -> Option<RegionHeap> {
        let region_size = manager.constants().region_size;
        let reserve = raw_align_up(max_heap_bytes, region_size) / region_size;
        let account = HeapAccount::open(&manager, reserve)?;
        let boot_regions = manager.boot_account().reserve_size();
        let covered_start = manager.constants().pool_start + boot_regions * region_size;
        let covered_end = manager.constants().pool_end;
        let min_cell_size = MIN_CELL_SIZE.max(2 * BYTES_IN_WORD * *options.words_covered_per_bit);
        info!(
            "heap account {:?}: reserve {} regions, covered [{}, {})",
            account.id(),
            reserve,
            covered_start,
            covered_end
        );
        Some(RegionHeap {
            manager,
            account,
            regions: Mutex::new(RegionList::new(LinkSet::Ownership)),
            linear: LinearAllocator::new_unbacked(0),
            tlab: MultiChunkTlabAllocator::new_unbacked(),
            tlab_min_chunk: *options.tlab_min_chunk_size,
            min_cell_size,
            covered_start,
            covered_end,
        })
    }

    /// The span the mark bitmap must cover: everything the heap can ever
    /// allocate into.
    pub fn covered(&self) -> (Address, Address) {
        (self.covered_start, self.covered_end)
    }

    pub fn account(&self) -> &HeapAccount {
        &self.account
    }

    pub fn manager(&self) -> &RegionManager {
        &self.manager
    }

    /// The smallest cell this heap hands out: two mark-bitmap granules, so
    /// every cell's color pair is private to it.
    pub fn min_cell_size(&self) -> usize {
        self.min_cell_size
    }

    /// Allocate a zeroed cell of at least `cell_size` bytes. `None` means
    /// the heap is out of space and the caller should collect.
    pub fn allocate_object(&self, cell_size: usize) -> Option<Address> {
        let size = raw_align_up(cell_size, BYTES_IN_WORD).max(self.min_cell_size);
        let cell = self.linear.allocate(size, self)?;
        // Recycled chunks carry stale headers and dead-space fill.
        crate::util::memory::zero(cell, size);
        Some(cell)
    }

    /// Allocate a reference-array cell: two header words (hub and length)
    /// followed by `length` elements of `element_size` bytes.
    pub fn allocate_array(&self, element_size: usize, length: usize) -> Option<Address> {
        let size = 2 * BYTES_IN_WORD + element_size * length;
        self.allocate_object(size)
    }

    /// Allocate a TLAB of at least `size` bytes; the returned span carries
    /// the free-chunk format (single chunk or linked multi-chunk list).
    pub fn allocate_tlab(&self, size: usize) -> Option<Address> {
        let size = raw_align_up(size.max(self.tlab_min_chunk), BYTES_IN_WORD);
        self.tlab.allocate_tlab(size, self)
    }

    /// Total bytes sitting on the heap's free-chunk lists.
    pub fn free_chunk_bytes(&self) -> usize {
        let regions = self.regions.lock().unwrap();
        let table = self.manager.table();
        regions
            .iter(table)
            .map(|id| table.region_info(id).free_bytes())
            .sum()
    }

    /// The free-chunk list head of the region containing `addr`, for
    /// inspection.
    pub fn region_free_chunks(&self, addr: Address) -> Option<(Address, usize)> {
        let info = self.manager.region_info_for(addr)?;
        Some((info.free_chunks(), info.free_bytes()))
    }

    // ---- refill plumbing --------------------------------------------------

    /// Take a free-chunk-formatted span of at least `min_bytes`: first fit
    /// over the regions' free lists, then a fresh region from the account.
    fn take_space(&self, min_bytes: usize) -> Option<HeapFreeChunk> {
        let mut regions = self.regions.lock().unwrap();
        let table = self.manager.table();
        for id in regions.iter(table) {
            let info = table.region_info(id);
            let mut head = HeapFreeChunk::from_address(info.free_chunks());
            if head.is_zero() {
                continue;
            }
            let got = HeapFreeChunk::remove_first_fit(&mut head, min_bytes);
            if !got.is_zero() {
                info.set_free_chunks(head.to_address(), info.free_bytes() - got.size());
                return Some(got);
            }
        }
        // No parsable hole fits; take fresh regions, contiguously when the
        // request spans more than one.
        let region_size = self.manager.constants().region_size;
        let needed = min_bytes.div_ceil(region_size).max(1);
        let first = if needed == 1 {
            self.account.allocate(&self.manager)
        } else {
            self.account.allocate_contiguous(&self.manager, needed)
        };
        if !first.is_valid() {
            return None;
        }
        for i in 0..needed {
            regions.push_back(table, first.skip(i));
        }
        let start = self.manager.constants().region_address(first);
        trace!(
            "heap {:?}: fresh region run [{:?}; {}]",
            self.account.id(),
            first,
            needed
        );
        Some(HeapFreeChunk::format(start, needed * region_size, unsafe {
            Address::zero()
        }))
    }

    /// Return a leftover span to the heap: re-chunk it when it is worth a
    /// future refill, otherwise make it parsable dead space.
    fn retire_span(&self, start: Address, size: usize) {
        if size == 0 {
            return;
        }
        if size >= self.tlab_min_chunk {
            let _regions = self.regions.lock().unwrap();
            let info = self
                .manager
                .region_info_for(start)
                .expect("leftover outside the reserved range");
            let chunk = HeapFreeChunk::format(start, size, info.free_chunks());
            info.set_free_chunks(chunk.to_address(), info.free_bytes() + size);
        } else {
            free_chunk::fill_dead_space(start, size);
        }
    }

    // ---- sweeping ---------------------------------------------------------

    /// Start a collection cycle: drop every free-chunk list (the sweep
    /// rebuilds them from the mark bitmap) and capture the allocators'
    /// unallocated tails, which the sweep must not reclaim.
    pub fn begin_sweep(&self) -> SweepClip {
        let regions = self.regions.lock().unwrap();
        let table = self.manager.table();
        for id in regions.iter(table) {
            table
                .region_info(id)
                .set_free_chunks(unsafe { Address::zero() }, 0);
        }
        SweepClip {
            exclusions: [
                (self.linear.top(), self.linear.hard_limit()),
                (self.tlab.linear().top(), self.tlab.linear().hard_limit()),
            ],
        }
    }

    /// Give a dead range back to the heap, clipping to committed regions the
    /// heap owns and to the allocator tails captured at `begin_sweep`.
    fn reclaim_range(&self, start: Address, end: Address, clip: &SweepClip) -> usize {
        let mut reclaimed = 0;
        for (seg_start, seg_end) in clip.subtract(start, end) {
            reclaimed += self.reclaim_clipped(seg_start, seg_end);
        }
        reclaimed
    }

    fn reclaim_clipped(&self, start: Address, end: Address) -> usize {
        let constants = *self.manager.constants();
        let table = self.manager.table();
        let mut reclaimed = 0;
        let mut cursor = start;
        while cursor < end {
            let id = constants.region_id(cursor);
            debug_assert!(id.is_valid());
            let region_end = constants.region_address(id) + constants.region_size;
            let span_end = end.min(region_end);
            let info = table.region_info(id);
            if info.is_committed() && info.owner() == self.account.id() {
                let len = span_end - cursor;
                if len >= self.tlab_min_chunk {
                    let chunk = HeapFreeChunk::format(cursor, len, info.free_chunks());
                    info.set_free_chunks(chunk.to_address(), info.free_bytes() + len);
                } else {
                    free_chunk::fill_dead_space(cursor, len);
                }
                reclaimed += len;
            }
            cursor = span_end;
        }
        reclaimed
    }

    /// The sweeper that closes the loop: reclaimed gaps become free chunks
    /// on their regions' lists.
    pub fn sweeper<'h, R: Runtime>(
        &'h self,
        runtime: &'h R,
        clip: SweepClip,
    ) -> RegionHeapSweeper<'h, R> {
        RegionHeapSweeper {
            heap: self,
            runtime,
            clip,
            live_bytes: 0,
            dead_bytes: 0,
            live_cells: 0,
        }
    }
}

/// The allocators' unallocated tails, captured when a sweep begins; the
/// sweeper subtracts them from every reclaimed range.
#[derive(Copy, Clone, Debug)]
pub struct SweepClip {
    exclusions: [(Address, Address); 2],
}

impl SweepClip {
    /// `[start, end)` minus the exclusions, as up to three sub-ranges.
    fn subtract(&self, start: Address, end: Address) -> Vec<(Address, Address)> {
        let mut segments = vec![(start, end)];
        for &(ex_start, ex_end) in &self.exclusions {
            if ex_start >= ex_end {
                continue;
            }
            let mut next = Vec::with_capacity(segments.len() + 1);
            for (s, e) in segments {
                if ex_end <= s || ex_start >= e {
                    next.push((s, e));
                    continue;
                }
                if s < ex_start {
                    next.push((s, ex_start));
                }
                if ex_end < e {
                    next.push((ex_end, e));
                }
            }
            segments = next;
        }
        segments
    }
}

/// Rebuilds the free-chunk lists from sweep events.
pub struct RegionHeapSweeper<'h, R: Runtime> {
    heap: &'h RegionHeap,
    runtime: &'h R,
    clip: SweepClip,
    live_bytes: usize,
    dead_bytes: usize,
    live_cells: usize,
}

impl<R: Runtime> RegionHeapSweeper<'_, R> {
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn dead_bytes(&self) -> usize {
        self.dead_bytes
    }

    pub fn live_cells(&self) -> usize {
        self.live_cells
    }
}

impl<R: Runtime> Sweeper for RegionHeapSweeper<'_, R> {
    fn process_live_object(&mut self, cell: Address) -> Address {
        let size = self.runtime.size_of(cell);
        self.live_bytes += size;
        self.live_cells += 1;
        cell + size
    }

    fn process_large_gap(&mut self, left_end: Address, right_start: Address) {
        self.dead_bytes += self.heap.reclaim_range(left_end, right_start, &self.clip);
    }

    fn process_dead_space(&mut self, start: Address, bytes: usize) {
        self.dead_bytes += self.heap.reclaim_range(start, start + bytes, &self.clip);
    }
}

impl RefillManager for RegionHeap {
    fn allocate_refill(
        &self,
        requested: usize,
        top: Address,
        space_left: usize,
    ) -> Option<HeapFreeChunk> {
        self.retire_span(top, space_left);
        self.take_space(requested.max(HEADER_BYTES))
    }
}

impl TlabRefillManager for RegionHeap {
    fn refill_tlab(
        &self,
        requested: usize,
        leftover_start: Address,
        leftover_size: usize,
    ) -> TlabRefill {
        self.retire_span(leftover_start, leftover_size);
        if let Some(chunk) = self.take_space(requested) {
            return TlabRefill::Refilled(chunk);
        }
        // No single span fits; gather smaller chunks into a multi-chunk
        // TLAB.
        let mut head = HeapFreeChunk::from_address(unsafe { Address::zero() });
        let mut total = 0;
        while total < requested {
            match self.take_space(self.tlab_min_chunk) {
                Some(chunk) => {
                    chunk.set_next(head);
                    total += chunk.size();
                    head = chunk;
                }
                None => break,
            }
        }
        if head.is_zero() {
            TlabRefill::Exhausted
        } else {
            TlabRefill::ChunkList(head)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;
    use crate::util::memory;

    const REGION: usize = 16 * BYTES_IN_PAGE;

    fn options() -> Options {
        let mut options = Options::default();
        assert!(options.set_from_command_line("region_size_in_bytes", &REGION.to_string()));
        assert!(options.set_from_command_line("tlab_min_chunk_size", "256"));
        options
    }

    fn heap(regions: usize) -> RegionHeap {
        let size = regions * REGION;
        let start = memory::reserve_address_space(size + REGION).unwrap();
        let manager = Arc::new(RegionManager::initialize(start, size + REGION, REGION));
        RegionHeap::new(manager, &options(), 8 * REGION).unwrap()
    }

    #[test]
    fn object_allocation_is_contiguous() {
        let heap = heap(16);
        let a = heap.allocate_object(32).unwrap();
        let b = heap.allocate_object(64).unwrap();
        assert_eq!(a + 32usize, b);
        assert!(heap.covered().0 <= a && b < heap.covered().1);
    }

    #[test]
    fn small_objects_are_padded_to_min_cell() {
        let heap = heap(16);
        let a = heap.allocate_object(8).unwrap();
        let b = heap.allocate_object(8).unwrap();
        assert_eq!(b - a, heap.min_cell_size());
    }

    #[test]
    fn tlab_is_chunk_formatted() {
        let heap = heap(16);
        let tlab = heap.allocate_tlab(1024).unwrap();
        assert!(HeapFreeChunk::is_valid_chunk(tlab));
        let chunk = HeapFreeChunk::from_address(tlab);
        assert!(chunk.size() >= 1024);
    }

    #[test]
    fn exhaustion_returns_none() {
        let heap = heap(16);
        // The account reserve is 8 regions; a 9th region's worth of
        // allocation cannot be satisfied.
        let mut allocated = 0;
        while heap.allocate_object(REGION / 4).is_some() {
            allocated += REGION / 4;
            assert!(allocated <= 9 * REGION);
        }
        assert!(allocated >= 7 * REGION);
    }

    #[test]
    fn sweep_clip_subtracts_tails() {
        let a = unsafe { Address::from_usize(0x1000) };
        let clip = SweepClip {
            exclusions: [
                (a + 0x100usize, a + 0x200usize),
                (a, a), // empty
            ],
        };
        let segments = clip.subtract(a, a + 0x300usize);
        assert_eq!(segments, vec![(a, a + 0x100usize), (a + 0x200usize, a + 0x300usize)]);
    }
}
