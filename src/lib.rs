//! Mantle is a region-based heap manager with a tricolor mark-bitmap
//! collector and a thread-freeze (safepoint) protocol for managed runtimes.
//!
//! Logically, the crate is built from these layers:
//! * The region layer ([`util::heap`]): a reserved virtual range carved into
//!   fixed-size regions, tracked in a dense region table, allocated and
//!   committed by the region allocator, and owned through per-client heap
//!   accounts.
//! * Allocators ([`util::alloc`]): a word-aligned CAS-bump linear allocator
//!   and a non-blocking multi-chunk TLAB allocator, both refilled through
//!   contracts that hand leftovers back as parsable free chunks.
//! * The tracer ([`policy::marker`]): a tricolor mark bitmap with a bounded
//!   marking stack, two marking-stack overflow recovery strategies, and
//!   precise/imprecise sweeping that feeds live-cell and gap events to a
//!   sweeper.
//! * The freeze/thaw protocol ([`scheduler`]): a single VM-operation thread
//!   that brings selected mutators to a safepoint (via a CAS or a
//!   fence-based per-thread state machine and a read-protected
//!   triggered-locals page), runs an operation, and thaws them.
//! * The binding ([`vm`]): the traits an embedding runtime implements to
//!   describe object layouts, enumerate roots and consume sweep events.
//!
//! An embedder creates an instance with [`memory_manager::init`], allocates
//! through the [`memory_manager`] functions, and requests collections with
//! [`memory_manager::collect`] when an allocation returns `None`.

#[macro_use]
extern crate log;

pub mod util;
mod mantle;
pub mod memory_manager;
pub mod policy;
pub mod scheduler;
pub mod vm;

pub use crate::mantle::{GcCause, Mantle};
