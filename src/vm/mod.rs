//! The runtime binding: the interfaces the heap requires of its embedder.
//!
//! The crate never interprets object contents on its own. An embedder
//! implements [`Runtime`] to describe object shapes (the layout oracle),
//! enumerate roots, and observe special (weak/finalizable) references; it
//! implements [`Sweeper`] to consume the live-cell and gap events a sweep
//! produces.

mod layout;
mod roots;
mod sweeper;

pub use layout::{for_each_reference_slot, ObjectLayout};
pub use roots::RootVisitor;
pub use sweeper::Sweeper;

use crate::util::Address;

/// The binding between the heap and the runtime embedding it.
///
/// The layout methods are queried once per visited cell inside the tracing
/// and sweeping loops; implementations are expected to be cheap table or
/// header lookups with no allocation.
pub trait Runtime: 'static + Send + Sync {
    /// The size in bytes of the cell at `cell`, a multiple of the word size.
    /// Cells must span at least two mark-bitmap granules so that each cell's
    /// pair of color bits is private to it.
    fn size_of(&self, cell: Address) -> usize;

    /// The hub (class/shape identifier) word of the cell.
    fn hub_of(&self, cell: Address) -> Address;

    /// The reference layout of the cell.
    fn layout_of(&self, cell: Address) -> ObjectLayout<'_>;

    /// Does this hub describe a special (weak/finalizable) reference object?
    fn is_special_reference(&self, hub: Address) -> bool {
        let _ = hub;
        false
    }

    /// Called once per traced special-reference cell, during marking, so the
    /// runtime can queue it for discovery processing after the collection.
    fn discover_special_reference(&self, cell: Address) {
        let _ = cell;
    }

    /// Invoke the visitor on every root: each stack or register slot that
    /// may hold a reference, and each cell of the immutable boot image.
    fn enumerate_roots(&self, visitor: &mut dyn RootVisitor);
}
