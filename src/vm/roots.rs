//! Root enumeration.

use crate::util::Address;

/// Receives the root set from the runtime's enumerator. Registered once at
/// heap creation; invoked by the collector with every reference originating
/// outside the covered area.
pub trait RootVisitor {
    /// A slot (stack word, register save slot, global) that may hold a
    /// reference. The visitor loads the slot itself; slots holding zero or
    /// addresses outside the covered area are ignored.
    fn visit_slot(&mut self, slot: Address);

    /// A reference known directly, e.g. a boot-image cell.
    fn visit_cell(&mut self, cell: Address);
}
