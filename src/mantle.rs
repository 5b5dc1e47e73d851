//! The Mantle instance.
//!
//! All global mutable state is modeled as one handle created at
//! initialization and passed explicitly: the options, the runtime binding,
//! the region manager, the heap, the marker and the VM-operation thread.
//! The handle is cheap to share; everything under it is internally
//! synchronized, and the marker is only ever borrowed mutably on the
//! VM-operation thread.

use std::fmt;
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

use crate::policy::marker::{MarkStats, TricolorHeapMarker};
use crate::policy::region_heap::RegionHeap;
use crate::scheduler::{
    FreezeConfig, MutatorContext, MutatorRegistry, VmOperation, VmOperationThread,
};
use crate::util::heap::region_manager::RegionManager;
use crate::util::options::Options;
use crate::util::Address;
use crate::vm::Runtime;

/// Why a collection was requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcCause {
    /// The embedder asked for one.
    Explicit,
    /// An allocation returned null.
    AllocationFailure,
    /// Debugging and tests.
    Debug,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GcCause::Explicit => write!(f, "explicit"),
            GcCause::AllocationFailure => write!(f, "allocation failure"),
            GcCause::Debug => write!(f, "debug"),
        }
    }
}

pub(crate) struct MantleInner<R: Runtime> {
    pub options: Options,
    pub runtime: R,
    pub manager: Arc<RegionManager>,
    pub heap: RegionHeap,
    pub marker: AtomicRefCell<TricolorHeapMarker>,
    pub registry: Arc<MutatorRegistry>,
}

/// An instance of the heap: the entry point for embedders.
pub struct Mantle<R: Runtime> {
    inner: Arc<MantleInner<R>>,
    vm_thread: VmOperationThread,
}

impl<R: Runtime> Mantle<R> {
    pub(crate) fn new(runtime: R, options: Options, max_heap_bytes: usize) -> Mantle<R> {
        let region_size = *options.region_size_in_bytes;
        // Reserve the heap plus the manager's own footprint: the region
        // table and alignment slack.
        let heap_regions = max_heap_bytes.div_ceil(region_size);
        let table_estimate = crate::util::heap::region::RegionTable::bytes_needed(
            heap_regions + 2,
        );
        let reserved_size =
            heap_regions * region_size + crate::util::conversions::raw_align_up(table_estimate, region_size)
                + 2 * region_size;
        let reserved = crate::util::memory::reserve_address_space(reserved_size)
            .expect("cannot reserve the heap address range");
        let manager = Arc::new(RegionManager::initialize(
            reserved,
            reserved_size,
            region_size,
        ));
        let heap = RegionHeap::new(manager.clone(), &options, max_heap_bytes)
            .expect("the reserved range cannot back the requested heap size");
        let (covered_start, covered_end) = heap.covered();
        let marker = TricolorHeapMarker::new(covered_start, covered_end, &options);
        let registry = Arc::new(MutatorRegistry::new());
        let config = FreezeConfig::from_options(&options);
        let vm_thread = VmOperationThread::spawn(registry.clone(), config);
        let inner = Arc::new(MantleInner {
            options,
            runtime,
            manager,
            heap,
            marker: AtomicRefCell::new(marker),
            registry,
        });
        Mantle { inner, vm_thread }
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn runtime(&self) -> &R {
        &self.inner.runtime
    }

    pub fn region_manager(&self) -> &Arc<RegionManager> {
        &self.inner.manager
    }

    pub fn heap(&self) -> &RegionHeap {
        &self.inner.heap
    }

    pub fn mutator_registry(&self) -> &Arc<MutatorRegistry> {
        &self.inner.registry
    }

    pub fn vm_thread(&self) -> &VmOperationThread {
        &self.vm_thread
    }

    /// Statistics of the most recent marking pass.
    pub fn mark_stats(&self) -> MarkStats {
        self.inner.marker.borrow().stats()
    }

    /// The color of a cell after the last collection, for inspection.
    pub fn color_of(&self, cell: Address) -> crate::policy::marker::Color {
        self.inner.marker.borrow().color_of(cell)
    }

    /// Register the calling thread as a mutator.
    pub fn bind_mutator(&self, name: &str) -> Arc<MutatorContext> {
        // The locals block is the latch target while safepoints are
        // disabled; it lives as long as the process, like the thread map
        // entries of the running VM.
        let locals: &'static mut [usize; 16] = Box::leak(Box::new([0; 16]));
        self.inner
            .registry
            .register(name, Address::from_ptr(locals.as_ptr()))
    }

    /// Remove a mutator from the thread map.
    pub fn destroy_mutator(&self, mutator: &MutatorContext) {
        self.inner.registry.unregister(mutator.id());
    }

    /// Submit a VM operation and wait for it (unless it is async). The
    /// operation is handed back so results can be downcast out of it.
    pub fn submit_operation(&self, op: Box<dyn VmOperation>) -> std::sync::Arc<dyn VmOperation> {
        self.vm_thread.submit(op)
    }

    /// Run a stop-the-world collection: freeze all mutators, trace the heap
    /// and sweep reclaimable gaps back onto the free-chunk lists.
    pub fn collect(&self, cause: GcCause) {
        info!("collection requested: {}", cause);
        let op = Box::new(CollectOperation {
            inner: self.inner.clone(),
            cause,
        });
        self.submit_operation(op);
    }
}

/// The stop-the-world collection operation: `mark_all` followed by an
/// imprecise sweep feeding the heap's own sweeper.
struct CollectOperation<R: Runtime> {
    inner: Arc<MantleInner<R>>,
    cause: GcCause,
}

impl<R: Runtime> VmOperation for CollectOperation<R> {
    fn name(&self) -> &'static str {
        "collect"
    }

    fn do_it(&self) {
        let inner = &self.inner;
        let mut marker = inner.marker.borrow_mut();
        marker.mark_all(&inner.runtime);
        let clip = inner.heap.begin_sweep();
        let mut sweeper = inner.heap.sweeper(&inner.runtime, clip);
        marker.sweep_imprecise(
            &inner.runtime,
            &mut sweeper,
            *inner.options.min_reclaimable_space,
        );
        info!(
            "collection ({}) complete: {} cells marked, {} bytes reclaimed",
            self.cause,
            marker.stats().cells_visited,
            sweeper.dead_bytes()
        );
    }
}
