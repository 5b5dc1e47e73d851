//! A self-describing test runtime: objects live in real committed heap
//! memory, and their shapes are registered in a side table the collector
//! queries through the `Runtime` trait.

use std::collections::HashMap;
use std::sync::Mutex;

use mantle::memory_manager;
use mantle::util::options::Options;
use mantle::util::Address;
use mantle::vm::{ObjectLayout, RootVisitor, Runtime};
use mantle::Mantle;

pub struct TestRuntime {
    /// cell address -> (size in bytes, layout). Layout slices are leaked so
    /// the borrow returned by `layout_of` is `'static`.
    objects: Mutex<HashMap<usize, (usize, ObjectLayout<'static>)>>,
    roots: Mutex<Vec<Address>>,
}

impl TestRuntime {
    pub fn new() -> TestRuntime {
        TestRuntime {
            objects: Mutex::new(HashMap::new()),
            roots: Mutex::new(Vec::new()),
        }
    }

    pub fn add_object(&self, cell: Address, size: usize, layout: ObjectLayout<'static>) {
        self.objects.lock().unwrap().insert(cell.as_usize(), (size, layout));
    }

    pub fn add_root(&self, cell: Address) {
        self.roots.lock().unwrap().push(cell);
    }
}

impl Runtime for TestRuntime {
    fn size_of(&self, cell: Address) -> usize {
        self.objects.lock().unwrap()[&cell.as_usize()].0
    }

    fn hub_of(&self, cell: Address) -> Address {
        cell
    }

    fn layout_of(&self, cell: Address) -> ObjectLayout<'_> {
        self.objects.lock().unwrap()[&cell.as_usize()].1
    }

    fn enumerate_roots(&self, visitor: &mut dyn RootVisitor) {
        for &root in self.roots.lock().unwrap().iter() {
            visitor.visit_cell(root);
        }
    }
}

/// Build an instance with 64 KiB regions, one word covered per bit, and any
/// extra `key=value` options on top.
pub fn fixture(extra_options: &str, max_heap_bytes: usize) -> Mantle<TestRuntime> {
    let mut options = Options::default();
    assert!(options.set_bulk_from_command_line(
        "region_size_in_bytes=65536 words_covered_per_bit=1 min_reclaimable_space=256 tlab_min_chunk_size=256"
    ));
    if !extra_options.is_empty() {
        assert!(options.set_bulk_from_command_line(extra_options));
    }
    memory_manager::init(TestRuntime::new(), options, max_heap_bytes)
}

/// Allocate a tuple cell whose reference slots sit at the given byte
/// offsets, registering its shape with the runtime.
pub fn alloc_tuple(
    mantle: &Mantle<TestRuntime>,
    size: usize,
    ref_offsets: Vec<usize>,
) -> Address {
    let cell = memory_manager::allocate_object(mantle, size).expect("test heap exhausted");
    let actual = size.max(mantle.heap().min_cell_size());
    let offsets: &'static [usize] = Box::leak(ref_offsets.into_boxed_slice());
    mantle
        .runtime()
        .add_object(cell, actual, ObjectLayout::Tuple { ref_offsets: offsets });
    cell
}

/// Allocate a reference-array cell of `length` elements, registering its
/// shape and storing the length word.
pub fn alloc_ref_array(mantle: &Mantle<TestRuntime>, length: usize) -> Address {
    let cell =
        memory_manager::allocate_array(mantle, mantle::util::constants::BYTES_IN_WORD, length)
            .expect("test heap exhausted");
    let size = (2 + length) * mantle::util::constants::BYTES_IN_WORD;
    unsafe {
        (cell + mantle::util::constants::BYTES_IN_WORD).store::<usize>(length);
    }
    mantle.runtime().add_object(
        cell,
        size.max(mantle.heap().min_cell_size()),
        ObjectLayout::RefArray {
            length_offset: mantle::util::constants::BYTES_IN_WORD,
            elements_offset: 2 * mantle::util::constants::BYTES_IN_WORD,
        },
    );
    cell
}

/// Store a reference into a cell's slot at the given byte offset.
pub fn store_ref(cell: Address, offset: usize, target: Address) {
    unsafe { (cell + offset).store::<Address>(target) }
}
