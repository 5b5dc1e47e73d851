//! The fixed-size region allocator.
//!
//! Tracks every region of the reserved range in two bitmaps: `allocated`
//! (handed to some heap account) and `committed` (backed by OS memory).
//! Allocation is first-fit over the free bitmap, lowest region id first.
//! All mutations are serialized under an internal lock. Invariant violations
//! (double free, commit of a free region, uncommit of an uncommitted region)
//! are fatal: they indicate heap-account bookkeeping corruption, and no
//! caller can recover from that.

use spin::Mutex;

use crate::util::constants::LOG_BITS_IN_WORD;
use crate::util::heap::region::{RegionConstants, RegionId};
use crate::util::memory;
use crate::util::Address;

struct Bitmaps {
    /// One bit per region: set when the region is handed out.
    allocated: Vec<u64>,
    /// One bit per region: set when the region's memory is committed.
    committed: Vec<u64>,
    allocated_count: usize,
    committed_count: usize,
}

impl Bitmaps {
    fn bit(map: &[u64], index: usize) -> bool {
        map[index >> LOG_BITS_IN_WORD] & (1u64 << (index & 63)) != 0
    }

    fn set_bit(map: &mut [u64], index: usize) {
        map[index >> LOG_BITS_IN_WORD] |= 1u64 << (index & 63);
    }

    fn clear_bit(map: &mut [u64], index: usize) {
        map[index >> LOG_BITS_IN_WORD] &= !(1u64 << (index & 63));
    }
}

/// Allocates, frees and commits contiguous runs of regions.
pub struct RegionAllocator {
    constants: RegionConstants,
    sync: Mutex<Bitmaps>,
}

impl RegionAllocator {
    pub fn new(constants: RegionConstants) -> RegionAllocator {
        let words = constants.num_regions.div_ceil(64);
        RegionAllocator {
            constants,
            sync: Mutex::new(Bitmaps {
                allocated: vec![0; words],
                committed: vec![0; words],
                allocated_count: 0,
                committed_count: 0,
            }),
        }
    }

    /// The number of regions managed.
    pub fn capacity(&self) -> usize {
        self.constants.num_regions
    }

    /// The number of regions currently handed out.
    pub fn allocated_count(&self) -> usize {
        self.sync.lock().allocated_count
    }

    /// The number of regions currently committed.
    pub fn committed_count(&self) -> usize {
        self.sync.lock().committed_count
    }

    /// The reserved range this allocator carves up.
    pub fn bounds(&self) -> (Address, Address) {
        (self.constants.pool_start, self.constants.pool_end)
    }

    /// Is the address inside the reserved range?
    pub fn contains(&self, addr: Address) -> bool {
        self.constants.contains(addr)
    }

    pub fn is_valid_region_id(&self, id: RegionId) -> bool {
        self.constants.is_valid_region_id(id)
    }

    /// Allocate a contiguous run of `n` free regions. Returns the first
    /// region of the run, or `RegionId::INVALID` if no such run exists.
    /// First-fit: the lowest-id run wins.
    pub fn allocate(&self, n: usize) -> RegionId {
        debug_assert!(n > 0);
        let mut sync = self.sync.lock();
        let num = self.constants.num_regions;
        let mut candidate = 0;
        while candidate + n <= num {
            let mut run = 0;
            while run < n && !Bitmaps::bit(&sync.allocated, candidate + run) {
                run += 1;
            }
            if run == n {
                for i in candidate..candidate + n {
                    Bitmaps::set_bit(&mut sync.allocated, i);
                }
                sync.allocated_count += n;
                trace!("region allocator: allocated [{}, {})", candidate, candidate + n);
                return RegionId::from_index(candidate);
            }
            // The run was broken at candidate + run; restart just past it.
            candidate += run + 1;
        }
        RegionId::INVALID
    }

    /// Mark `n` regions starting at `first` free again. The regions must all
    /// be allocated and must have been uncommitted first.
    pub fn free(&self, first: RegionId, n: usize) {
        let mut sync = self.sync.lock();
        for i in first.index()..first.index() + n {
            assert!(
                Bitmaps::bit(&sync.allocated, i),
                "double free of region {i}"
            );
            assert!(
                !Bitmaps::bit(&sync.committed, i),
                "freeing region {i} while it is still committed"
            );
            Bitmaps::clear_bit(&mut sync.allocated, i);
        }
        sync.allocated_count -= n;
    }

    /// Commit the backing memory of `n` regions starting at `first`. The
    /// regions must be allocated and not yet committed.
    pub fn commit(&self, first: RegionId, n: usize) {
        let mut sync = self.sync.lock();
        for i in first.index()..first.index() + n {
            assert!(
                Bitmaps::bit(&sync.allocated, i),
                "commit of free region {i}"
            );
            assert!(
                !Bitmaps::bit(&sync.committed, i),
                "commit of already-committed region {i}"
            );
        }
        let start = self.constants.region_address(first);
        memory::commit(start, n * self.constants.region_size)
            .unwrap_or_else(|e| panic!("failed to commit regions [{first:?}; {n}]: {e}"));
        for i in first.index()..first.index() + n {
            Bitmaps::set_bit(&mut sync.committed, i);
        }
        sync.committed_count += n;
    }

    /// Return the backing memory of `n` regions starting at `first` to the
    /// OS. The regions must be committed.
    pub fn uncommit(&self, first: RegionId, n: usize) {
        let mut sync = self.sync.lock();
        for i in first.index()..first.index() + n {
            assert!(
                Bitmaps::bit(&sync.committed, i),
                "uncommit of uncommitted region {i}"
            );
        }
        let start = self.constants.region_address(first);
        memory::uncommit(start, n * self.constants.region_size)
            .unwrap_or_else(|e| panic!("failed to uncommit regions [{first:?}; {n}]: {e}"));
        for i in first.index()..first.index() + n {
            Bitmaps::clear_bit(&mut sync.committed, i);
        }
        sync.committed_count -= n;
    }

    /// Is the region currently allocated?
    pub fn is_allocated(&self, id: RegionId) -> bool {
        Bitmaps::bit(&self.sync.lock().allocated, id.index())
    }

    /// Is the region currently committed?
    pub fn is_committed(&self, id: RegionId) -> bool {
        Bitmaps::bit(&self.sync.lock().committed, id.index())
    }

    /// A copy of the allocated bitmap, one bit per region.
    /// Intended for assertions and tests.
    pub fn snapshot_allocated(&self) -> Vec<u64> {
        self.sync.lock().allocated.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;
    use crate::util::memory;

    fn allocator(num_regions: usize) -> (RegionAllocator, Address) {
        let region_size = BYTES_IN_PAGE;
        let size = num_regions * region_size;
        let start = memory::reserve_address_space(size + region_size).unwrap();
        let start = start.align_up(region_size);
        let constants = RegionConstants::new(start, start + size, region_size);
        (RegionAllocator::new(constants), start)
    }

    #[test]
    fn first_fit_lowest_id() {
        let (ra, _) = allocator(16);
        assert_eq!(ra.allocate(2), RegionId::from_index(0));
        assert_eq!(ra.allocate(1), RegionId::from_index(2));
        ra.free(RegionId::from_index(0), 2);
        // Freed run is re-used before higher ids.
        assert_eq!(ra.allocate(1), RegionId::from_index(0));
    }

    #[test]
    fn contiguous_run_skips_holes() {
        let (ra, _) = allocator(16);
        assert_eq!(ra.allocate(3), RegionId::from_index(0));
        assert_eq!(ra.allocate(1), RegionId::from_index(3));
        ra.free(RegionId::from_index(0), 3);
        // A run of 4 cannot use [0,3): region 3 is taken.
        assert_eq!(ra.allocate(4), RegionId::from_index(4));
    }

    #[test]
    fn exhaustion_returns_invalid() {
        let (ra, _) = allocator(4);
        assert!(ra.allocate(5) == RegionId::INVALID);
        assert_eq!(ra.allocate(4), RegionId::from_index(0));
        assert!(ra.allocate(1) == RegionId::INVALID);
    }

    #[test]
    fn alloc_free_round_trips_bitmap() {
        let (ra, _) = allocator(16);
        let before = ra.snapshot_allocated();
        let first = ra.allocate(5);
        assert!(first.is_valid());
        ra.free(first, 5);
        assert_eq!(ra.snapshot_allocated(), before);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let (ra, _) = allocator(4);
        let first = ra.allocate(1);
        ra.free(first, 1);
        ra.free(first, 1);
    }

    #[test]
    #[should_panic(expected = "commit of free region")]
    fn commit_of_free_is_fatal() {
        let (ra, _) = allocator(4);
        ra.commit(RegionId::from_index(1), 1);
    }

    #[test]
    fn commit_makes_memory_writable() {
        let (ra, start) = allocator(4);
        let first = ra.allocate(2);
        ra.commit(first, 2);
        unsafe {
            start.store::<usize>(0xCAFE);
            assert_eq!(start.load::<usize>(), 0xCAFE);
        }
        ra.uncommit(first, 2);
        ra.free(first, 2);
    }
}
