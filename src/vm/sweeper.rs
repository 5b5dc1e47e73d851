//! The sweeper interface.

use crate::util::Address;

/// Consumes the live-cell and gap events produced by a sweep.
///
/// A precise sweep reports every live cell; the sweeper tracks the dead
/// intervals between them itself. An imprecise sweep reports only gaps of at
/// least the configured reclaimable minimum, plus the dead intervals before
/// the first and after the last live cell. Either way the sweeper typically
/// reacts by planting free-chunk format on the reported spans
/// (see [`crate::util::heap::free_chunk`]).
pub trait Sweeper {
    /// A live (black) cell. Returns the address one past the cell.
    fn process_live_object(&mut self, cell: Address) -> Address;

    /// A reclaimable gap between two live cells: `[left_end, right_start)`.
    fn process_large_gap(&mut self, left_end: Address, right_start: Address);

    /// A dead interval at the boundary of the covered area (before the first
    /// live cell or after the last one).
    fn process_dead_space(&mut self, start: Address, bytes: usize);
}
