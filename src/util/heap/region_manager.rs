//! The heap region manager.
//!
//! Owns the reserved virtual range and everything carved from it: the region
//! table, the region allocator and the unreserved pool that heap accounts
//! draw their reserves from. Initialization bootstraps the manager out of
//! the range itself: the first regions are committed and a bootstrap linear
//! allocator placed at the start of the range satisfies the manager's own
//! allocations (the region table), after which those regions are
//! retroactively charged to the boot account.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::util::alloc::linear_allocator::{LinearAllocator, NeverRefill};
use crate::util::conversions;
use crate::util::heap::account::HeapAccount;
use crate::util::heap::region::{AccountId, RegionConstants, RegionId, RegionInfo, RegionTable};
use crate::util::heap::region_allocator::RegionAllocator;
use crate::util::Address;

/// The region manager: the backing of all higher heap layers.
pub struct RegionManager {
    table: RegionTable,
    allocator: RegionAllocator,
    /// Regions not yet promised to any account.
    unreserved: AtomicUsize,
    next_account: AtomicU32,
    /// The bootstrap linear allocator. After initialization it keeps serving
    /// small VM-lifetime metadata allocations from the boot regions.
    boot_allocator: LinearAllocator,
    boot_account: HeapAccount,
}

impl RegionManager {
    /// Initialize the manager over `[reserved_start, reserved_start +
    /// reserved_size)`, which must be reserved (quarantined) address space.
    /// The range is rounded inward to region boundaries.
    pub fn initialize(
        reserved_start: Address,
        reserved_size: usize,
        region_size: usize,
    ) -> RegionManager {
        let pool_start = reserved_start.align_up(region_size);
        let pool_end = (reserved_start + reserved_size).align_down(region_size);
        assert!(
            pool_end > pool_start,
            "reserved range [{reserved_start}, {}) holds no region",
            reserved_start + reserved_size
        );
        let constants = RegionConstants::new(pool_start, pool_end, region_size);

        // The manager's own footprint: the region table, rounded up to whole
        // regions. The region lists are threaded through the table records,
        // so the table is the whole of it.
        let table_bytes = conversions::raw_align_up(
            RegionTable::bytes_needed(constants.num_regions),
            crate::util::constants::BYTES_IN_WORD,
        );
        let boot_regions = conversions::raw_align_up(table_bytes, region_size) / region_size;
        assert!(
            boot_regions < constants.num_regions,
            "the region table alone would consume the whole range"
        );

        let allocator = RegionAllocator::new(constants);
        let first = allocator.allocate(boot_regions);
        assert!(first == RegionId::from_index(0));
        allocator.commit(first, boot_regions);

        // All allocations below are satisfied linearly from the start of the
        // committed span.
        let boot_allocator =
            LinearAllocator::new(pool_start, boot_regions * region_size, 0);
        let table_base = boot_allocator
            .allocate(table_bytes, &NeverRefill)
            .expect("bootstrap allocation overran the initial regions");
        let table = RegionTable::initialize(constants, table_base);

        // Open the boot account and retroactively charge it with the regions
        // consumed above.
        let boot_account = HeapAccount::open_preallocated(AccountId::from_index(0), boot_regions);
        for i in 0..boot_regions {
            let id = RegionId::from_index(i);
            table.region_info(id).set_committed(true);
            boot_account.adopt_region(&table, id);
        }

        let manager = RegionManager {
            table,
            allocator,
            unreserved: AtomicUsize::new(constants.num_regions - boot_regions),
            next_account: AtomicU32::new(1),
            boot_allocator,
            boot_account,
        };
        debug_assert!(
            manager.boot_allocator.end() <= pool_start + boot_regions * region_size
        );
        info!(
            "region manager: {} regions of {} KiB at {}, {} bootstrap",
            constants.num_regions,
            region_size >> 10,
            pool_start,
            boot_regions
        );
        manager
    }

    pub fn constants(&self) -> &RegionConstants {
        self.table.constants()
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    pub fn allocator(&self) -> &RegionAllocator {
        &self.allocator
    }

    pub fn boot_allocator(&self) -> &LinearAllocator {
        &self.boot_allocator
    }

    pub fn boot_account(&self) -> &HeapAccount {
        &self.boot_account
    }

    /// Regions not yet promised to any account.
    pub fn unreserved(&self) -> usize {
        self.unreserved.load(Ordering::Relaxed)
    }

    /// Take `n` regions out of the unreserved pool. Fails, taking nothing,
    /// if fewer than `n` are unreserved.
    pub fn reserve(&self, n: usize) -> bool {
        let mut current = self.unreserved.load(Ordering::Relaxed);
        loop {
            if current < n {
                return false;
            }
            match self.unreserved.compare_exchange_weak(
                current,
                current - n,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    /// Return `n` regions to the unreserved pool.
    pub fn release(&self, n: usize) {
        let prior = self.unreserved.fetch_add(n, Ordering::Relaxed);
        debug_assert!(prior + n <= self.constants().num_regions);
    }

    pub(crate) fn next_account_id(&self) -> AccountId {
        AccountId::from_index(self.next_account.fetch_add(1, Ordering::Relaxed) as usize)
    }

    /// The id of the region containing `addr`, or `RegionId::INVALID`.
    pub fn region_id(&self, addr: Address) -> RegionId {
        self.constants().region_id(addr)
    }

    /// The descriptor of the region containing `addr`, if any.
    pub fn region_info_for(&self, addr: Address) -> Option<&RegionInfo> {
        self.table.region_info_for(addr)
    }

    /// Is the address inside the reserved range?
    pub fn contains(&self, addr: Address) -> bool {
        self.constants().contains(addr)
    }

    /// The reserved range.
    pub fn bounds(&self) -> (Address, Address) {
        self.allocator.bounds()
    }
}
