//! End-to-end mark/sweep scenarios over a real committed heap.

mod common;

use common::*;
use mantle::memory_manager;
use mantle::policy::marker::Color;
use mantle::util::heap::HeapFreeChunk;
use mantle::GcCause;

/// Single-thread linear heap: five objects, one root, one collection. The
/// survivor is black, the rest are reclaimed into a single free chunk
/// starting right after the survivor.
#[test]
fn single_thread_linear_heap() {
    let mantle = fixture("", 1 << 20);
    let sizes = [24usize, 80, 16, 4096, 40];
    let cells: Vec<_> = sizes
        .iter()
        .map(|&size| alloc_tuple(&mantle, size, vec![]))
        .collect();
    // Allocation is linear from the covered start.
    let (covered_start, _) = mantle.heap().covered();
    assert_eq!(cells[0], covered_start);
    for window in cells.windows(2) {
        assert!(window[1] > window[0]);
    }

    mantle.runtime().add_root(cells[0]);
    memory_manager::collect(&mantle, GcCause::Explicit);

    assert_eq!(mantle.color_of(cells[0]), Color::Black);
    for &dead in &cells[1..] {
        assert_eq!(mantle.color_of(dead), Color::White);
    }

    // The dead run [24, 24 + 4232) became one free chunk on the region.
    let dead_bytes: usize = sizes[1..].iter().sum();
    assert_eq!(dead_bytes, 4232);
    let (head, free_bytes) = mantle.heap().region_free_chunks(cells[0]).unwrap();
    assert_eq!(free_bytes, dead_bytes);
    assert_eq!(head, cells[0] + sizes[0]);
    let chunk = HeapFreeChunk::from_address(head);
    assert!(HeapFreeChunk::is_valid_chunk(head));
    assert_eq!(chunk.size(), dead_bytes);
    assert!(chunk.next().is_zero());
}

/// A cell whose leading bit index is 63: its color pair spans two bitmap
/// words and must still mark and scan correctly.
#[test]
fn cross_word_color() {
    let mantle = fixture("", 1 << 20);
    // 63 words, then the cell under test at bit index 63.
    let filler = alloc_tuple(&mantle, 63 * 8, vec![]);
    let cell = alloc_tuple(&mantle, 16, vec![]);
    let (covered_start, _) = mantle.heap().covered();
    assert_eq!(cell - covered_start, 63 * 8);

    mantle.runtime().add_root(filler);
    mantle.runtime().add_root(cell);
    memory_manager::collect(&mantle, GcCause::Explicit);

    assert_eq!(mantle.color_of(cell), Color::Black);
    assert_eq!(mantle.color_of(filler), Color::Black);
}

/// Marking-stack overflow with the rescan map: 10,000 cells in a reverse
/// chain, all also referenced by one wide array, traced with a 128-entry
/// stack. Everything ends black and at least one recovery scan ran.
#[test]
fn marking_stack_overflow_with_rescan_map() {
    let mantle = fixture("use_rescan_map=true mark_stack_capacity=128", 4 << 20);
    const CELLS: usize = 10_000;
    let cells: Vec<_> = (0..CELLS)
        .map(|_| alloc_tuple(&mantle, 16, vec![8]))
        .collect();
    for i in 1..CELLS {
        store_ref(cells[i], 8, cells[i - 1]);
    }
    let array = alloc_ref_array(&mantle, CELLS);
    for (i, &cell) in cells.iter().enumerate() {
        store_ref(array, (2 + i) * 8, cell);
    }
    mantle.runtime().add_root(array);

    memory_manager::collect(&mantle, GcCause::Explicit);

    for &cell in &cells {
        assert_eq!(mantle.color_of(cell), Color::Black);
    }
    assert_eq!(mantle.color_of(array), Color::Black);
    let stats = mantle.mark_stats();
    assert_eq!(stats.cells_visited, CELLS + 1);
    assert!(stats.overflows >= 1);
    assert!(stats.recovery_scans >= 1);
}

/// The same overflow load with the linear rescan, shallow and deep flush.
#[test]
fn marking_stack_overflow_with_linear_rescan() {
    for deep in [false, true] {
        let mantle = fixture(
            &format!("mark_stack_capacity=128 use_deep_mark_stack_flush={deep}"),
            4 << 20,
        );
        const CELLS: usize = 10_000;
        let cells: Vec<_> = (0..CELLS)
            .map(|_| alloc_tuple(&mantle, 16, vec![8]))
            .collect();
        for i in 1..CELLS {
            store_ref(cells[i], 8, cells[i - 1]);
        }
        let array = alloc_ref_array(&mantle, CELLS);
        for (i, &cell) in cells.iter().enumerate() {
            store_ref(array, (2 + i) * 8, cell);
        }
        mantle.runtime().add_root(array);

        memory_manager::collect(&mantle, GcCause::Explicit);

        for &cell in &cells {
            assert_eq!(mantle.color_of(cell), Color::Black);
        }
        let stats = mantle.mark_stats();
        assert!(stats.overflows >= 1, "deep={deep}");
    }
}

/// Imprecise sweep with a 256-byte threshold: only the 400-byte gap becomes
/// a free chunk; the 104-byte gap is dead-filled in place.
#[test]
fn imprecise_sweep_thresholds() {
    let mantle = fixture("", 1 << 20);
    let a = alloc_tuple(&mantle, 32, vec![]);
    let b = alloc_tuple(&mantle, 104, vec![]); // dies
    let c = alloc_tuple(&mantle, 32, vec![]);
    let d = alloc_tuple(&mantle, 400, vec![]); // dies
    let e = alloc_tuple(&mantle, 32, vec![]);

    mantle.runtime().add_root(a);
    mantle.runtime().add_root(c);
    mantle.runtime().add_root(e);
    memory_manager::collect(&mantle, GcCause::Explicit);

    for live in [a, c, e] {
        assert_eq!(mantle.color_of(live), Color::Black);
    }
    for dead in [b, d] {
        assert_eq!(mantle.color_of(dead), Color::White);
    }

    // Exactly one free chunk: the 400-byte gap between c and e.
    let (head, free_bytes) = mantle.heap().region_free_chunks(a).unwrap();
    assert_eq!(free_bytes, 400);
    assert_eq!(head, d);
    let chunk = HeapFreeChunk::from_address(head);
    assert_eq!(chunk.size(), 400);
    assert!(chunk.next().is_zero());
    // The sub-threshold gap was filled with the dead-space pattern.
    assert!(mantle::util::heap::free_chunk::is_dead_space(b));
}

/// Reclaimed space is reusable: after a collection the next allocation is
/// satisfied from the rebuilt free-chunk lists without new regions.
#[test]
fn allocation_reuses_swept_space() {
    let mantle = fixture("", 1 << 20);
    let keep = alloc_tuple(&mantle, 32, vec![]);
    for _ in 0..100 {
        alloc_tuple(&mantle, 512, vec![]);
    }
    mantle.runtime().add_root(keep);
    let regions_before = mantle.heap().account().allocated_count();
    memory_manager::collect(&mantle, GcCause::Explicit);
    assert!(mantle.heap().free_chunk_bytes() >= 100 * 512);

    for _ in 0..100 {
        alloc_tuple(&mantle, 512, vec![]);
    }
    assert_eq!(mantle.heap().account().allocated_count(), regions_before);
}

/// Seeded random object graphs: after marking, reachability computed in the
/// test matches the colors in the bitmap exactly.
#[test]
fn random_graphs_match_reachability() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0x5EED);

    let mantle = fixture("mark_stack_capacity=64", 2 << 20);
    const CELLS: usize = 2_000;
    const SLOTS: usize = 3;
    let cells: Vec<_> = (0..CELLS)
        .map(|_| alloc_tuple(&mantle, (1 + SLOTS) * 8, vec![8, 16, 24]))
        .collect();
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); CELLS];
    for (i, &cell) in cells.iter().enumerate() {
        for slot in 0..SLOTS {
            if rng.random_bool(0.7) {
                let target = rng.random_range(0..CELLS);
                store_ref(cell, (1 + slot) * 8, cells[target]);
                edges[i].push(target);
            }
        }
    }
    let root = rng.random_range(0..CELLS);
    mantle.runtime().add_root(cells[root]);

    // Reference reachability, computed in the test.
    let mut reachable = vec![false; CELLS];
    let mut work = vec![root];
    while let Some(i) = work.pop() {
        if std::mem::replace(&mut reachable[i], true) {
            continue;
        }
        work.extend(edges[i].iter().copied());
    }

    memory_manager::collect(&mantle, GcCause::Explicit);
    for (i, &cell) in cells.iter().enumerate() {
        let expected = if reachable[i] { Color::Black } else { Color::White };
        assert_eq!(mantle.color_of(cell), expected, "cell {i}");
    }
}
