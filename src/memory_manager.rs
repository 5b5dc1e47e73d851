//! The heap client API.
//!
//! Free functions wrapping the [`Mantle`] handle, mirroring the lifecycle of
//! an embedding runtime: initialize once, bind each mutator thread, allocate
//! (null return means "request a collection"), collect, poll safepoints.

use std::sync::Arc;

use crate::mantle::{GcCause, Mantle};
use crate::scheduler::{self, MutatorContext, TrapOutcome};
use crate::util::options::Options;
use crate::util::Address;
use crate::vm::Runtime;

/// Initialize an instance of the heap: reserve the address range, bootstrap
/// the region manager, create the heap account covering `max_heap_bytes`,
/// and start the VM-operation thread. Environment-variable settings
/// (`MANTLE_*`) are applied on top of the passed options.
pub fn init<R: Runtime>(runtime: R, mut options: Options, max_heap_bytes: usize) -> Mantle<R> {
    crate::util::logger::try_init();
    options.read_env_var_settings();
    Mantle::new(runtime, options, max_heap_bytes)
}

/// Register the calling thread as a mutator.
pub fn bind_mutator<R: Runtime>(mantle: &Mantle<R>, name: &str) -> Arc<MutatorContext> {
    mantle.bind_mutator(name)
}

/// Remove a mutator from the thread map. The thread must not be frozen.
pub fn destroy_mutator<R: Runtime>(mantle: &Mantle<R>, mutator: &MutatorContext) {
    mantle.destroy_mutator(mutator)
}

/// Allocate a zeroed cell of `cell_size` bytes. `None` indicates the heap
/// is out of space; the caller should [`collect`] and retry.
pub fn allocate_object<R: Runtime>(mantle: &Mantle<R>, cell_size: usize) -> Option<Address> {
    mantle.heap().allocate_object(cell_size)
}

/// Allocate a reference-array cell of `length` elements of
/// `element_size` bytes, after a two-word header.
pub fn allocate_array<R: Runtime>(
    mantle: &Mantle<R>,
    element_size: usize,
    length: usize,
) -> Option<Address> {
    mantle.heap().allocate_array(element_size, length)
}

/// Allocate a thread-local allocation buffer of at least `size` bytes. The
/// span carries the heap-free-chunk format. `None` indicates heap
/// exhaustion.
pub fn allocate_tlab<R: Runtime>(mantle: &Mantle<R>, size: usize) -> Option<Address> {
    mantle.heap().allocate_tlab(size)
}

/// Run a stop-the-world collection.
pub fn collect<R: Runtime>(mantle: &Mantle<R>, cause: GcCause) {
    mantle.collect(cause)
}

/// Explicit safepoint poll for the calling mutator. Returns true when the
/// poll blocked for a VM operation.
pub fn poll_safepoint<R: Runtime>(mantle: &Mantle<R>, mutator: &MutatorContext) -> bool {
    scheduler::poll(
        mutator,
        mantle.mutator_registry(),
        mantle.vm_thread().config(),
    )
}

/// Route a memory-protection trap taken by a mutator into the safepoint
/// machinery. Called by the embedder's fault handler.
pub fn dispatch_trap<R: Runtime>(
    mantle: &Mantle<R>,
    mutator: &MutatorContext,
    fault_addr: Address,
    in_native: bool,
) -> TrapOutcome {
    scheduler::dispatch_trap(
        mutator,
        mantle.mutator_registry(),
        mantle.vm_thread().config(),
        fault_addr,
        in_native,
    )
}
