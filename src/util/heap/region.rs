//! Regions and the region table.
//!
//! The reserved virtual range is carved into fixed-size, power-of-two-aligned
//! regions. A region is identified by a dense non-negative id; all mutable
//! per-region state lives in a [`RegionInfo`] record in the region table, a
//! dense array indexed by region id. The table itself is placed inside the
//! heap's bootstrap regions by the region manager, so `region_info(id)` is a
//! single multiply-and-add away from the table base.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use atomic::Atomic;

use crate::util::constants::BYTES_IN_PAGE;
use crate::util::Address;

/// Identifies a region in the reserved range. Dense: region 0 starts at the
/// pool start, region `n` at `pool_start + n * region_size`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, bytemuck::NoUninit)]
pub struct RegionId(u32);

impl RegionId {
    /// Reserved sentinel for "no region".
    pub const INVALID: RegionId = RegionId(u32::MAX);

    /// Construct from a dense index.
    pub const fn from_index(index: usize) -> RegionId {
        RegionId(index as u32)
    }

    /// The dense index of this region.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Is this a real region id (not the sentinel)?
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// The id of the region `n` regions after this one.
    pub fn skip(self, n: usize) -> RegionId {
        RegionId(self.0 + n as u32)
    }
}

/// Identifies a heap account. Accounts are registered with the region
/// manager; region ownership is recorded as an account id in [`RegionInfo`].
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AccountId(u32);

impl AccountId {
    /// Sentinel for a region owned by no account.
    pub const NONE: AccountId = AccountId(u32::MAX);

    pub const fn from_index(index: usize) -> AccountId {
        AccountId(index as u32)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_some(self) -> bool {
        self != Self::NONE
    }
}

/// Region geometry, computed once when the region manager initializes and
/// immutable thereafter.
#[derive(Copy, Clone, Debug)]
pub struct RegionConstants {
    /// log2 of the region size in bytes.
    pub log_region_size: u8,
    /// The region size in bytes. A power of two, at least one page.
    pub region_size: usize,
    /// The number of regions in the pool.
    pub num_regions: usize,
    /// The first address of region 0.
    pub pool_start: Address,
    /// The address one past the last region.
    pub pool_end: Address,
}

impl RegionConstants {
    /// Compute the geometry for a region-aligned pool.
    pub fn new(pool_start: Address, pool_end: Address, region_size: usize) -> RegionConstants {
        assert!(region_size.is_power_of_two() && region_size >= BYTES_IN_PAGE);
        assert!(pool_start.is_aligned_to(region_size));
        assert!(pool_end.is_aligned_to(region_size));
        RegionConstants {
            log_region_size: region_size.trailing_zeros() as u8,
            region_size,
            num_regions: (pool_end - pool_start) >> region_size.trailing_zeros() as usize,
            pool_start,
            pool_end,
        }
    }

    /// The id of the region containing `addr`, or `RegionId::INVALID` if the
    /// address is outside the reserved range.
    pub fn region_id(&self, addr: Address) -> RegionId {
        if addr < self.pool_start || addr >= self.pool_end {
            return RegionId::INVALID;
        }
        RegionId(((addr - self.pool_start) >> self.log_region_size as usize) as u32)
    }

    /// The first address of the given region.
    pub fn region_address(&self, id: RegionId) -> Address {
        debug_assert!(id.index() < self.num_regions);
        self.pool_start + (id.index() << self.log_region_size as usize)
    }

    /// Is the address inside the reserved range?
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.pool_start && addr < self.pool_end
    }

    /// Is the id a valid index into the region table?
    pub fn is_valid_region_id(&self, id: RegionId) -> bool {
        id.is_valid() && id.index() < self.num_regions
    }
}

/// Which of a region's two intrusive link pairs a list threads through.
/// A region is on at most one list per link set: the accounting links tie it
/// to its account's allocated list, the ownership links to whatever list its
/// heap client keeps (e.g. a client's allocation list).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkSet {
    Accounting,
    Ownership,
}

/// Per-region mutable state. One record per region, held in the dense region
/// table. Fields are atomics so records can be updated under different locks
/// (the allocator's bitmap lock, an account's list lock, the VM-operation
/// thread during sweeping) without aliasing trouble.
#[repr(C)]
pub struct RegionInfo {
    /// The account owning this region, or `AccountId::NONE`.
    owner: AtomicU32,
    /// Whether the region's backing memory is committed.
    committed: AtomicBool,
    /// Intrusive links threading this region onto its account's list.
    prev_acct: AtomicU32,
    next_acct: AtomicU32,
    /// Intrusive links threading this region onto its client's list.
    prev_own: AtomicU32,
    next_own: AtomicU32,
    /// Head of the region's free-chunk list, maintained by the sweeper and
    /// consumed by TLAB refills. Zero when the region has no parsable holes.
    free_chunks: Atomic<Address>,
    /// Total bytes on the free-chunk list.
    free_bytes: AtomicUsize,
}

impl RegionInfo {
    const fn new_empty() -> RegionInfo {
        RegionInfo {
            owner: AtomicU32::new(AccountId::NONE.0),
            committed: AtomicBool::new(false),
            prev_acct: AtomicU32::new(RegionId::INVALID.0),
            next_acct: AtomicU32::new(RegionId::INVALID.0),
            prev_own: AtomicU32::new(RegionId::INVALID.0),
            next_own: AtomicU32::new(RegionId::INVALID.0),
            free_chunks: Atomic::new(unsafe { Address::zero() }),
            free_bytes: AtomicUsize::new(0),
        }
    }

    pub fn owner(&self) -> AccountId {
        AccountId(self.owner.load(Ordering::Relaxed))
    }

    pub fn set_owner(&self, owner: AccountId) {
        self.owner.store(owner.0, Ordering::Relaxed);
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn set_committed(&self, committed: bool) {
        self.committed.store(committed, Ordering::Relaxed);
    }

    pub fn prev(&self, set: LinkSet) -> RegionId {
        let link = match set {
            LinkSet::Accounting => &self.prev_acct,
            LinkSet::Ownership => &self.prev_own,
        };
        RegionId(link.load(Ordering::Relaxed))
    }

    pub fn set_prev(&self, set: LinkSet, prev: RegionId) {
        let link = match set {
            LinkSet::Accounting => &self.prev_acct,
            LinkSet::Ownership => &self.prev_own,
        };
        link.store(prev.0, Ordering::Relaxed);
    }

    pub fn next(&self, set: LinkSet) -> RegionId {
        let link = match set {
            LinkSet::Accounting => &self.next_acct,
            LinkSet::Ownership => &self.next_own,
        };
        RegionId(link.load(Ordering::Relaxed))
    }

    pub fn set_next(&self, set: LinkSet, next: RegionId) {
        let link = match set {
            LinkSet::Accounting => &self.next_acct,
            LinkSet::Ownership => &self.next_own,
        };
        link.store(next.0, Ordering::Relaxed);
    }

    pub fn free_chunks(&self) -> Address {
        self.free_chunks.load(Ordering::Relaxed)
    }

    pub fn set_free_chunks(&self, head: Address, bytes: usize) {
        self.free_chunks.store(head, Ordering::Relaxed);
        self.free_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }
}

/// The dense region table. Lives at a fixed address inside the heap's
/// bootstrap regions; created once during region-manager initialization,
/// length fixed thereafter. All accessors are pure after `initialize`.
pub struct RegionTable {
    constants: RegionConstants,
    base: Address,
}

// The table is raw memory holding atomics only.
unsafe impl Send for RegionTable {}
unsafe impl Sync for RegionTable {}

impl RegionTable {
    /// The bytes needed to hold descriptors for `num_regions` regions.
    pub fn bytes_needed(num_regions: usize) -> usize {
        num_regions * std::mem::size_of::<RegionInfo>()
    }

    /// Plant the table at `base`, which must point at committed, zeroed
    /// memory of at least [`Self::bytes_needed`] bytes. Called exactly once,
    /// by the region manager, before any accessor.
    pub fn initialize(constants: RegionConstants, base: Address) -> RegionTable {
        assert!(base.is_aligned_to(std::mem::align_of::<RegionInfo>()));
        let table = RegionTable { constants, base };
        for id in 0..constants.num_regions {
            let record = table.base + id * std::mem::size_of::<RegionInfo>();
            unsafe {
                std::ptr::write(record.to_mut_ptr::<RegionInfo>(), RegionInfo::new_empty());
            }
        }
        table
    }

    pub fn constants(&self) -> &RegionConstants {
        &self.constants
    }

    /// The descriptor for the given region.
    pub fn region_info(&self, id: RegionId) -> &RegionInfo {
        debug_assert!(self.constants.is_valid_region_id(id));
        let record = self.base + id.index() * std::mem::size_of::<RegionInfo>();
        unsafe { &*record.to_ptr::<RegionInfo>() }
    }

    /// The descriptor for the region containing `addr`, if any.
    pub fn region_info_for(&self, addr: Address) -> Option<&RegionInfo> {
        let id = self.constants.region_id(addr);
        if id.is_valid() {
            Some(self.region_info(id))
        } else {
            None
        }
    }

    /// The id of the region whose descriptor is `info`. Inverse of
    /// [`Self::region_info`], by pointer arithmetic in the dense table.
    pub fn region_id_of(&self, info: &RegionInfo) -> RegionId {
        let addr = Address::from_ref(info);
        debug_assert!(addr >= self.base);
        RegionId::from_index((addr - self.base) / std::mem::size_of::<RegionInfo>())
    }

    /// The first address of the region whose descriptor is `info`.
    pub fn region_address_of(&self, info: &RegionInfo) -> Address {
        self.constants.region_address(self.region_id_of(info))
    }

    /// The descriptor of the next region in the table, if any.
    pub fn next(&self, info: &RegionInfo) -> Option<&RegionInfo> {
        let id = self.region_id_of(info).index() + 1;
        if id < self.constants.num_regions {
            Some(self.region_info(RegionId::from_index(id)))
        } else {
            None
        }
    }

    /// The descriptor of the previous region in the table, if any.
    pub fn prev(&self, info: &RegionInfo) -> Option<&RegionInfo> {
        let id = self.region_id_of(info).index();
        if id > 0 {
            Some(self.region_info(RegionId::from_index(id - 1)))
        } else {
            None
        }
    }
}
