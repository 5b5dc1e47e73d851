//! Heap accounts.
//!
//! An account is a named reserve of regions belonging to one owner (the boot
//! heap, a collector, a heap client). Opening an account takes its reserve
//! out of the region manager's unreserved pool up front; allocation then
//! only moves regions between the region allocator and the account's
//! allocated list, and can never oversubscribe the pool. The allocated list
//! is threaded intrusively through the region table's prev/next links and is
//! only mutated under the account's own lock.

use std::sync::Mutex;

use crate::util::heap::region::{AccountId, LinkSet, RegionId, RegionTable};
use crate::util::heap::region_manager::RegionManager;

/// A doubly linked list of regions, threaded through one of the two link
/// pairs in the region table.
pub struct RegionList {
    set: LinkSet,
    head: RegionId,
    tail: RegionId,
    len: usize,
}

impl RegionList {
    pub const fn new(set: LinkSet) -> RegionList {
        RegionList {
            set,
            head: RegionId::INVALID,
            tail: RegionId::INVALID,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> RegionId {
        self.head
    }

    /// Prepend a region. The region must not be on any list of this set.
    pub fn push_front(&mut self, table: &RegionTable, id: RegionId) {
        let info = table.region_info(id);
        debug_assert!(!info.prev(self.set).is_valid() && !info.next(self.set).is_valid());
        info.set_next(self.set, self.head);
        if self.head.is_valid() {
            table.region_info(self.head).set_prev(self.set, id);
        } else {
            self.tail = id;
        }
        self.head = id;
        self.len += 1;
    }

    /// Append a region. The region must not be on any list of this set.
    pub fn push_back(&mut self, table: &RegionTable, id: RegionId) {
        let info = table.region_info(id);
        debug_assert!(!info.prev(self.set).is_valid() && !info.next(self.set).is_valid());
        info.set_prev(self.set, self.tail);
        if self.tail.is_valid() {
            table.region_info(self.tail).set_next(self.set, id);
        } else {
            self.head = id;
        }
        self.tail = id;
        self.len += 1;
    }

    /// Unlink a region from this list.
    pub fn remove(&mut self, table: &RegionTable, id: RegionId) {
        let info = table.region_info(id);
        let prev = info.prev(self.set);
        let next = info.next(self.set);
        if prev.is_valid() {
            table.region_info(prev).set_next(self.set, next);
        } else {
            debug_assert!(self.head == id);
            self.head = next;
        }
        if next.is_valid() {
            table.region_info(next).set_prev(self.set, prev);
        } else {
            debug_assert!(self.tail == id);
            self.tail = prev;
        }
        info.set_prev(self.set, RegionId::INVALID);
        info.set_next(self.set, RegionId::INVALID);
        self.len -= 1;
    }

    /// Iterate region ids from head to tail.
    pub fn iter<'t>(&self, table: &'t RegionTable) -> RegionListIter<'t> {
        RegionListIter {
            table,
            set: self.set,
            cursor: self.head,
        }
    }
}

pub struct RegionListIter<'t> {
    table: &'t RegionTable,
    set: LinkSet,
    cursor: RegionId,
}

impl Iterator for RegionListIter<'_> {
    type Item = RegionId;

    fn next(&mut self) -> Option<RegionId> {
        if !self.cursor.is_valid() {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.table.region_info(id).next(self.set);
        Some(id)
    }
}

struct AccountSync {
    reserve: usize,
    allocated: RegionList,
}

/// A per-owner reserve of regions.
pub struct HeapAccount {
    id: AccountId,
    sync: Mutex<AccountSync>,
}

impl HeapAccount {
    /// Open an account with the given reserve, atomically claiming that many
    /// regions from the manager's unreserved pool. Fails if the pool has
    /// fewer than `reserve` regions left.
    pub fn open(manager: &RegionManager, reserve: usize) -> Option<HeapAccount> {
        if !manager.reserve(reserve) {
            return None;
        }
        Some(HeapAccount {
            id: manager.next_account_id(),
            sync: Mutex::new(AccountSync {
                reserve,
                allocated: RegionList::new(LinkSet::Accounting),
            }),
        })
    }

    /// Used by the region manager to open the boot account over regions it
    /// has already carved out; the reserve is not taken from the pool again.
    pub(crate) fn open_preallocated(id: AccountId, reserve: usize) -> HeapAccount {
        HeapAccount {
            id,
            sync: Mutex::new(AccountSync {
                reserve,
                allocated: RegionList::new(LinkSet::Accounting),
            }),
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn reserve_size(&self) -> usize {
        self.sync.lock().unwrap().reserve
    }

    pub fn allocated_count(&self) -> usize {
        self.sync.lock().unwrap().allocated.len()
    }

    /// Grow the account's reserve by `n` regions from the unreserved pool.
    pub fn grow(&self, manager: &RegionManager, n: usize) -> bool {
        if !manager.reserve(n) {
            return false;
        }
        self.sync.lock().unwrap().reserve += n;
        true
    }

    /// Allocate one region, commit it, and prepend it to the account's
    /// allocated list. Returns the region id, or `RegionId::INVALID` when
    /// the account is at its reserve or the allocator has no free region.
    pub fn allocate(&self, manager: &RegionManager) -> RegionId {
        let mut sync = self.sync.lock().unwrap();
        if sync.allocated.len() >= sync.reserve {
            return RegionId::INVALID;
        }
        let id = manager.allocator().allocate(1);
        if !id.is_valid() {
            return RegionId::INVALID;
        }
        manager.allocator().commit(id, 1);
        let table = manager.table();
        let info = table.region_info(id);
        info.set_committed(true);
        info.set_owner(self.id);
        sync.allocated.push_front(table, id);
        id
    }

    /// Allocate and commit a contiguous run of `n` regions, prepending each
    /// to the account's allocated list. Returns the first region of the
    /// run, or `RegionId::INVALID` when the reserve or the allocator cannot
    /// cover it. Used for spans larger than one region.
    pub fn allocate_contiguous(&self, manager: &RegionManager, n: usize) -> RegionId {
        debug_assert!(n > 0);
        let mut sync = self.sync.lock().unwrap();
        if sync.allocated.len() + n > sync.reserve {
            return RegionId::INVALID;
        }
        let first = manager.allocator().allocate(n);
        if !first.is_valid() {
            return RegionId::INVALID;
        }
        manager.allocator().commit(first, n);
        let table = manager.table();
        for i in 0..n {
            let id = first.skip(i);
            let info = table.region_info(id);
            info.set_committed(true);
            info.set_owner(self.id);
            sync.allocated.push_front(table, id);
        }
        first
    }

    /// Allocate up to `n` regions into `list`, appending or prepending.
    /// Contiguous runs are preferred; scattered regions are the fallback.
    /// With `exact`, either all `n` regions are allocated or none is, and 0
    /// is returned. Returns the number of regions allocated.
    pub fn allocate_list(
        &self,
        manager: &RegionManager,
        list: &mut RegionList,
        n: usize,
        append: bool,
        exact: bool,
    ) -> usize {
        let mut sync = self.sync.lock().unwrap();
        let headroom = sync.reserve - sync.allocated.len();
        if headroom < n {
            if exact {
                return 0;
            }
            if headroom == 0 {
                return 0;
            }
        }
        let want = n.min(headroom);

        let mut got: Vec<RegionId> = Vec::with_capacity(want);
        // Prefer one contiguous run.
        let first = manager.allocator().allocate(want);
        if first.is_valid() {
            for i in 0..want {
                got.push(first.skip(i));
            }
        } else {
            // Scattered fallback, one region at a time.
            for _ in 0..want {
                let id = manager.allocator().allocate(1);
                if !id.is_valid() {
                    break;
                }
                got.push(id);
            }
            if exact && got.len() < n {
                for id in got.drain(..) {
                    manager.allocator().free(id, 1);
                }
                return 0;
            }
        }

        let table = manager.table();
        for &id in &got {
            manager.allocator().commit(id, 1);
            let info = table.region_info(id);
            info.set_committed(true);
            info.set_owner(self.id);
            sync.allocated.push_front(table, id);
            if append {
                list.push_back(table, id);
            } else {
                list.push_front(table, id);
            }
        }
        got.len()
    }

    /// Uncommit a region and return it to the region allocator.
    pub fn free(&self, manager: &RegionManager, id: RegionId) {
        let mut sync = self.sync.lock().unwrap();
        let table = manager.table();
        let info = table.region_info(id);
        assert!(
            info.owner() == self.id,
            "account {:?} freeing region {:?} owned by {:?}",
            self.id,
            id,
            info.owner()
        );
        sync.allocated.remove(table, id);
        info.set_owner(AccountId::NONE);
        info.set_committed(false);
        info.set_free_chunks(unsafe { crate::util::Address::zero() }, 0);
        manager.allocator().uncommit(id, 1);
        manager.allocator().free(id, 1);
    }

    /// Move a committed region from this account to another. The region's
    /// contents are preserved.
    pub fn transfer(&self, manager: &RegionManager, id: RegionId, to: &HeapAccount) {
        assert!(self.id != to.id);
        // Lock both accounts in id order so crossing transfers cannot
        // deadlock.
        let (mut this, mut other) = if self.id.index() < to.id.index() {
            let a = self.sync.lock().unwrap();
            let b = to.sync.lock().unwrap();
            (a, b)
        } else {
            let b = to.sync.lock().unwrap();
            let a = self.sync.lock().unwrap();
            (a, b)
        };
        assert!(
            other.allocated.len() < other.reserve,
            "transfer target account {:?} is at its reserve",
            to.id
        );
        let table = manager.table();
        let info = table.region_info(id);
        assert!(info.owner() == self.id);
        this.allocated.remove(table, id);
        info.set_owner(to.id);
        other.allocated.push_front(table, id);
    }

    /// Iterate the account's allocated regions, head (most recent) first.
    pub fn with_allocated<T>(&self, f: impl FnOnce(&RegionList) -> T) -> T {
        f(&self.sync.lock().unwrap().allocated)
    }

    /// Used by the region manager to retroactively charge the bootstrap
    /// regions to the boot account.
    pub(crate) fn adopt_region(&self, table: &RegionTable, id: RegionId) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.allocated.len() < sync.reserve);
        table.region_info(id).set_owner(self.id);
        sync.allocated.push_back(table, id);
    }
}
