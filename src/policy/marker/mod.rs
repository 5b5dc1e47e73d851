//! The tricolor mark bitmap.
//!
//! A bitmap covers the heap at a granularity of `words_covered_per_bit`
//! words per bit. Every cell is assigned a leading bit, and the pair of bits
//! starting there encodes the cell's color:
//!
//! ```text
//!   WHITE = 00   BLACK = 01 (leading bit only)
//!   GREY  = 11   INVALID = 10
//! ```
//!
//! with the leading bit always at the lower bit position. When the leading
//! bit sits at position 63 of a bitmap word, the color spans two words and
//! the cross-word paths below apply.
//!
//! Marking runs in phases: clear, mark roots grey, forward scan (visit greys
//! left to right, blackening them; a finger separates scanned from
//! unscanned territory, and references behind the finger are deferred on a
//! bounded marking stack), drain the stack, and iterate while the rightmost
//! mark keeps growing. Marking-stack overflow is recovered with either a
//! bounded linear rescan or a region-granular rescan map. Sweeping walks
//! the final black marks and feeds live-cell and gap events to a
//! [`Sweeper`].
//!
//! Nothing here is atomic: the map is only mutated on the VM-operation
//! thread while mutators are frozen.

pub mod marking_stack;
pub mod rescan_map;

use static_assertions::const_assert;

use crate::util::constants::{LOG_BITS_IN_WORD, LOG_BYTES_IN_WORD};
use crate::util::heap::free_chunk;
use crate::util::options::Options;
use crate::util::Address;
use crate::vm::{for_each_reference_slot, RootVisitor, Runtime, Sweeper};
use marking_stack::MarkingStack;
use rescan_map::RescanMap;

/// The two-bit color of a cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Color {
    White = 0b00,
    Black = 0b01,
    Grey = 0b11,
    Invalid = 0b10,
}

// The leading bit is the low bit of the pair: black and grey both carry it.
const_assert!(Color::Black as u8 & 0b01 == 0b01);
const_assert!(Color::Grey as u8 & 0b01 == 0b01);
const_assert!(Color::White as u8 == 0);

/// How marking-stack overflow is recovered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Rescan linearly from the leftmost flushed mark up to the finger.
    LinearRescan,
    /// Track dirtied regions in a rescan map and revisit only those.
    RescanMap,
}

/// The marker's phase. Overflow recovery toggles between `ForwardScan` and
/// `OverflowScan`; everything ends back at `Idle`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkPhase {
    Idle,
    Clear,
    MarkRoots,
    ForwardScan,
    OverflowScan,
    Drain,
    Sweep,
}

/// Per-collection marking statistics.
#[derive(Copy, Clone, Debug, Default)]
pub struct MarkStats {
    /// Cells visited (greyed then blackened).
    pub cells_visited: usize,
    /// Marking-stack overflows (stack flushes).
    pub overflows: usize,
    /// Overflow recovery scans.
    pub recovery_scans: usize,
}

pub struct TricolorHeapMarker {
    covered_start: Address,
    covered_end: Address,
    /// log2 of the bytes covered by one bit.
    log_bytes_per_bit: usize,
    /// The color map. Sized so that the trailing cell's bit pair stays in
    /// bounds.
    words: Vec<u64>,
    num_bits: usize,

    phase: MarkPhase,
    /// The forward-scan position: cells at or before the finger are visited
    /// or pending on the stack; cells after it are found by the scan.
    finger: Address,
    /// Bounds of the marked area, maintained from mark-roots onward.
    leftmost: Address,
    rightmost: Address,

    stack: MarkingStack,
    strategy: OverflowStrategy,
    deep_flush: bool,
    /// Leftmost address needing an overflow rescan (linear strategy).
    overflow_scan_start: Address,
    overflow_pending: bool,
    rescan: RescanMap,

    stats: MarkStats,
}

impl TricolorHeapMarker {
    /// Create a marker from the instance options.
    pub fn new(covered_start: Address, covered_end: Address, options: &Options) -> Self {
        let strategy = if *options.use_rescan_map {
            OverflowStrategy::RescanMap
        } else {
            OverflowStrategy::LinearRescan
        };
        Self::with_config(
            covered_start,
            covered_end,
            *options.words_covered_per_bit,
            *options.mark_stack_capacity,
            strategy,
            *options.use_deep_mark_stack_flush,
            (*options.region_size_in_bytes).trailing_zeros() as usize,
        )
    }

    /// Create a marker with explicit configuration.
    pub fn with_config(
        covered_start: Address,
        covered_end: Address,
        words_covered_per_bit: usize,
        stack_capacity: usize,
        strategy: OverflowStrategy,
        deep_flush: bool,
        log_rescan_region_size: usize,
    ) -> Self {
        assert!(words_covered_per_bit.is_power_of_two());
        assert!(covered_end > covered_start);
        let log_bytes_per_bit =
            LOG_BYTES_IN_WORD as usize + words_covered_per_bit.trailing_zeros() as usize;
        assert!(covered_start.is_aligned_to(1 << log_bytes_per_bit));
        let num_bits = (covered_end - covered_start) >> log_bytes_per_bit;
        // One slack word so the trailing cell's second color bit, and the
        // cross-word probe one word ahead, stay in bounds.
        let num_words = (num_bits >> LOG_BITS_IN_WORD) + 2;
        TricolorHeapMarker {
            covered_start,
            covered_end,
            log_bytes_per_bit,
            words: vec![0; num_words],
            num_bits,
            phase: MarkPhase::Idle,
            finger: covered_start,
            leftmost: covered_end,
            rightmost: covered_start,
            stack: MarkingStack::new(stack_capacity),
            strategy,
            deep_flush,
            overflow_scan_start: Address::MAX,
            overflow_pending: false,
            rescan: RescanMap::new(covered_start, covered_end, log_rescan_region_size),
            stats: MarkStats::default(),
        }
    }

    pub fn covered_start(&self) -> Address {
        self.covered_start
    }

    pub fn covered_end(&self) -> Address {
        self.covered_end
    }

    pub fn phase(&self) -> MarkPhase {
        self.phase
    }

    pub fn stats(&self) -> MarkStats {
        self.stats
    }

    pub fn strategy(&self) -> OverflowStrategy {
        self.strategy
    }

    /// Is the address inside the area the bitmap covers?
    pub fn covers(&self, addr: Address) -> bool {
        addr >= self.covered_start && addr < self.covered_end
    }

    /// The leading bit index assigned to a cell.
    pub fn bit_index_of(&self, cell: Address) -> usize {
        debug_assert!(self.covers(cell));
        (cell - self.covered_start) >> self.log_bytes_per_bit
    }

    /// The cell address a leading bit stands for.
    pub fn address_of_bit(&self, bit: usize) -> Address {
        self.covered_start + (bit << self.log_bytes_per_bit)
    }

    // ---- color primitives -------------------------------------------------

    fn bit(&self, index: usize) -> bool {
        self.words[index >> LOG_BITS_IN_WORD] & (1u64 << (index & 63)) != 0
    }

    fn set_bit(&mut self, index: usize) {
        self.words[index >> LOG_BITS_IN_WORD] |= 1u64 << (index & 63);
    }

    fn clear_bit(&mut self, index: usize) {
        self.words[index >> LOG_BITS_IN_WORD] &= !(1u64 << (index & 63));
    }

    /// The color at a leading bit index, following the cross-word path when
    /// the pair spans two bitmap words.
    pub fn color_at(&self, bit: usize) -> Color {
        let leading = self.bit(bit);
        let following = self.bit(bit + 1);
        match (leading, following) {
            (false, false) => Color::White,
            (true, false) => Color::Black,
            (true, true) => Color::Grey,
            (false, true) => Color::Invalid,
        }
    }

    /// The color of a cell.
    pub fn color_of(&self, cell: Address) -> Color {
        self.color_at(self.bit_index_of(cell))
    }

    pub fn is_white(&self, cell: Address) -> bool {
        !self.bit(self.bit_index_of(cell))
    }

    /// Is the pair at `bit` grey? Detects colors spanning bitmap words.
    pub fn is_grey(&self, bit: usize) -> bool {
        self.bit(bit) && self.bit(bit + 1)
    }

    /// Is the cell black, assuming no greys remain in the map? Cheaper than
    /// [`Self::color_at`]: only the leading bit is read.
    pub fn is_black_when_no_greys(&self, bit: usize) -> bool {
        self.bit(bit)
    }

    fn mark_grey(&mut self, cell: Address) {
        let bit = self.bit_index_of(cell);
        debug_assert!(bit + 1 < self.num_bits + 64);
        self.set_bit(bit);
        self.set_bit(bit + 1);
    }

    /// Grey a white cell, maintaining the marked bounds. Returns false when
    /// the cell was already marked.
    fn mark_grey_if_white(&mut self, cell: Address) -> bool {
        if !self.is_white(cell) {
            return false;
        }
        self.mark_grey(cell);
        if cell < self.leftmost {
            self.leftmost = cell;
        }
        if cell > self.rightmost {
            self.rightmost = cell;
        }
        true
    }

    /// Turn a grey cell black by clearing the following bit of its pair.
    fn blacken(&mut self, cell: Address) {
        let bit = self.bit_index_of(cell);
        debug_assert!(self.is_grey(bit));
        self.clear_bit(bit + 1);
    }

    /// Find the leading bit of the next grey pair in `[from_bit, last_bit]`,
    /// one 64-bit word at a time: a word holds a grey iff `w & (w >> 1)` is
    /// non-zero, and a cross-word grey shows as bit 63 here plus bit 0 of
    /// the next word.
    fn next_grey(&self, from_bit: usize, last_bit: usize) -> Option<usize> {
        if from_bit > last_bit {
            return None;
        }
        let last_word = last_bit >> LOG_BITS_IN_WORD;
        let mut wi = from_bit >> LOG_BITS_IN_WORD;
        let mut w = self.words[wi] & !((1u64 << (from_bit & 63)) - 1);
        loop {
            let greys = w & (w >> 1);
            if greys != 0 {
                let bit = (wi << LOG_BITS_IN_WORD) + greys.trailing_zeros() as usize;
                return if bit <= last_bit { Some(bit) } else { None };
            }
            if (w >> 63) == 1 && (self.words[wi + 1] & 1) == 1 {
                let bit = (wi << LOG_BITS_IN_WORD) + 63;
                return if bit <= last_bit { Some(bit) } else { None };
            }
            if wi >= last_word {
                return None;
            }
            wi += 1;
            w = self.words[wi];
        }
    }

    /// Find the next set bit in `[from_bit, last_bit]`. After marking has
    /// completed every set bit is the leading bit of a black cell.
    fn next_set_bit(&self, from_bit: usize, last_bit: usize) -> Option<usize> {
        if from_bit > last_bit {
            return None;
        }
        let last_word = last_bit >> LOG_BITS_IN_WORD;
        let mut wi = from_bit >> LOG_BITS_IN_WORD;
        let mut w = self.words[wi] & !((1u64 << (from_bit & 63)) - 1);
        loop {
            if w != 0 {
                let bit = (wi << LOG_BITS_IN_WORD) + w.trailing_zeros() as usize;
                return if bit <= last_bit { Some(bit) } else { None };
            }
            if wi >= last_word {
                return None;
            }
            wi += 1;
            w = self.words[wi];
        }
    }

    // ---- marking ----------------------------------------------------------

    /// Trace the heap: clear the map, mark roots, scan forward, drain the
    /// marking stack, and iterate until the rightmost mark is stable. On
    /// return every reachable cell in the covered area is black and no grey
    /// remains anywhere.
    pub fn mark_all<R: Runtime>(&mut self, runtime: &R) {
        debug_assert!(self.phase == MarkPhase::Idle);
        self.clear();
        self.mark_roots(runtime);
        if self.leftmost > self.rightmost {
            // Empty root set: nothing reachable in the covered area.
            self.phase = MarkPhase::Idle;
            return;
        }
        loop {
            let old_rightmost = self.rightmost;
            self.forward_scan(runtime);
            self.drain(runtime);
            if self.rightmost == old_rightmost {
                break;
            }
        }
        self.assert_no_grey_left();
        debug!(
            "marked {} cells in [{}, {}], {} overflows, {} recovery scans",
            self.stats.cells_visited,
            self.leftmost,
            self.rightmost,
            self.stats.overflows,
            self.stats.recovery_scans
        );
        self.phase = MarkPhase::Idle;
    }

    /// Zero the color map and reset the scan state.
    fn clear(&mut self) {
        self.phase = MarkPhase::Clear;
        self.words.iter_mut().for_each(|w| *w = 0);
        self.leftmost = self.covered_end;
        self.rightmost = self.covered_start;
        self.finger = self.covered_start;
        self.overflow_scan_start = Address::MAX;
        self.overflow_pending = false;
        self.rescan.clear_all();
        self.stats = MarkStats::default();
        debug_assert!(self.stack.is_empty());
    }

    fn mark_roots<R: Runtime>(&mut self, runtime: &R) {
        self.phase = MarkPhase::MarkRoots;
        let mut visitor = RootMarkVisitor { marker: self };
        runtime.enumerate_roots(&mut visitor);
        trace!(
            "root marks span [{}, {}]",
            self.leftmost,
            self.rightmost
        );
    }

    /// Walk the color map from the leftmost mark, visiting every grey cell
    /// and blackening it. The bitmap cursor jumps past the end of each
    /// visited cell rather than advancing bit by bit.
    fn forward_scan<R: Runtime>(&mut self, runtime: &R) {
        self.phase = MarkPhase::ForwardScan;
        let mut bit = self.bit_index_of(self.leftmost);
        loop {
            let last_bit = self.bit_index_of(self.rightmost);
            match self.next_grey(bit, last_bit) {
                None => break,
                Some(grey_bit) => {
                    let cell = self.address_of_bit(grey_bit);
                    self.finger = cell;
                    let end = self.visit_cell(runtime, cell, cell);
                    if self.overflow_pending {
                        self.recover_from_overflow(runtime);
                        self.phase = MarkPhase::ForwardScan;
                    }
                    bit = if end < self.covered_end {
                        self.bit_index_of(end)
                    } else {
                        self.num_bits
                    };
                }
            }
        }
        // Everything at or before the rightmost mark is now visited or on
        // the stack; the drain phase owns the rest of the span.
        self.finger = self.covered_end;
    }

    /// Visit one grey cell: trace its references, blacken it, and return its
    /// end address. `scan_finger` is the finger of the scan this visit
    /// belongs to (forward or overflow); references at or before it are
    /// deferred on the marking stack.
    fn visit_cell<R: Runtime>(
        &mut self,
        runtime: &R,
        cell: Address,
        scan_finger: Address,
    ) -> Address {
        self.stats.cells_visited += 1;
        let size = runtime.size_of(cell);
        debug_assert!(
            size >= 2 << self.log_bytes_per_bit,
            "cell {cell} of {size} bytes spans fewer than two bitmap granules"
        );
        if runtime.is_special_reference(runtime.hub_of(cell)) {
            runtime.discover_special_reference(cell);
        }
        let layout = runtime.layout_of(cell);
        for_each_reference_slot(cell, layout, |slot| {
            let target: Address = unsafe { slot.load() };
            self.trace_reference(runtime, target, scan_finger);
        });
        self.blacken(cell);
        cell + size
    }

    /// Process one traced reference against the given finger.
    fn trace_reference<R: Runtime>(&mut self, runtime: &R, target: Address, finger: Address) {
        if target.is_zero() || !self.covers(target) {
            return;
        }
        debug_assert!(target.is_aligned_to(crate::util::constants::BYTES_IN_WORD));
        if !self.mark_grey_if_white(target) {
            return;
        }
        if target <= finger {
            self.push_deferred(runtime, target);
        } else if self.strategy == OverflowStrategy::RescanMap
            && self.phase == MarkPhase::OverflowScan
            && target < self.finger
        {
            // Greyed beyond the current dirty region but behind the forward
            // finger: nothing will walk over it again unless its region is
            // marked dirty too.
            self.rescan.set_for(target);
            self.overflow_pending = true;
        }
    }

    /// Push a backward reference, flushing the stack first when it is full.
    /// The flush leaves the stack empty, so the retried push always
    /// succeeds.
    fn push_deferred<R: Runtime>(&mut self, runtime: &R, cell: Address) {
        if self.stack.is_full() {
            self.flush_stack(runtime);
            debug_assert!(self.stack.is_empty());
        }
        self.stack.push(cell);
    }

    /// The overflow handler: empty the stack, leaving every flushed
    /// reference reachable by a later recovery scan.
    fn flush_stack<R: Runtime>(&mut self, runtime: &R) {
        self.stats.overflows += 1;
        self.overflow_pending = true;
        match self.strategy {
            OverflowStrategy::LinearRescan => {
                if self.deep_flush {
                    // Visit each flushed cell here and blacken it, so the
                    // rescan only has the newly greyed targets to redo.
                    let flushed: Vec<Address> = self.stack.drain().collect();
                    for cell in flushed {
                        if self.color_of(cell) != Color::Grey {
                            continue;
                        }
                        self.stats.cells_visited += 1;
                        let layout = runtime.layout_of(cell);
                        for_each_reference_slot(cell, layout, |slot| {
                            let target: Address = unsafe { slot.load() };
                            if target.is_zero() || !self.covers(target) {
                                return;
                            }
                            if self.mark_grey_if_white(target) && target < self.overflow_scan_start
                            {
                                self.overflow_scan_start = target;
                            }
                        });
                        self.blacken(cell);
                    }
                } else {
                    let mut leftmost_flushed = self.overflow_scan_start;
                    for cell in self.stack.drain() {
                        if cell < leftmost_flushed {
                            leftmost_flushed = cell;
                        }
                    }
                    self.overflow_scan_start = leftmost_flushed;
                }
            }
            OverflowStrategy::RescanMap => {
                // Flushed cells are only greyed (they already are); their
                // regions are recorded for the recovery scan.
                let flushed: Vec<Address> = self.stack.drain().collect();
                for cell in flushed {
                    self.rescan.set_for(cell);
                }
            }
        }
    }

    /// Recover from marking-stack overflow. On return every reference that
    /// was flushed has been visited and no cell strictly before the forward
    /// finger remains grey.
    fn recover_from_overflow<R: Runtime>(&mut self, runtime: &R) {
        let outer_phase = self.phase;
        self.phase = MarkPhase::OverflowScan;
        self.stats.recovery_scans += 1;
        match self.strategy {
            OverflowStrategy::LinearRescan => loop {
                self.overflow_pending = false;
                let start = std::mem::replace(&mut self.overflow_scan_start, Address::MAX);
                if start < self.finger {
                    self.bounded_grey_scan(runtime, start, self.finger);
                }
                self.drain_deferred(runtime);
                if !self.overflow_pending && self.stack.is_empty() {
                    break;
                }
            },
            OverflowStrategy::RescanMap => loop {
                self.overflow_pending = false;
                while let Some(region) = self.rescan.clear_first_set() {
                    let start = self.rescan.region_start(region);
                    let end = self.rescan.region_end(region).min(self.finger);
                    if start < end {
                        self.bounded_grey_scan(runtime, start, end);
                    }
                }
                self.drain_deferred(runtime);
                if self.rescan.is_empty() && self.stack.is_empty() {
                    break;
                }
            },
        }
        self.phase = outer_phase;
    }

    /// Visit every grey cell in `[start, end)` with an overflow finger
    /// distinct from the forward finger: references behind the cell being
    /// visited are deferred, references ahead of it are reached as this
    /// scan proceeds. Cells already blackened (by a deep flush) are skipped.
    fn bounded_grey_scan<R: Runtime>(&mut self, runtime: &R, start: Address, end: Address) {
        let mut bit = self.bit_index_of(start);
        let last_bit = self.bit_index_of(end.sub(1));
        while let Some(grey_bit) = self.next_grey(bit, last_bit) {
            let cell = self.address_of_bit(grey_bit);
            if cell >= end {
                break;
            }
            let cell_end = self.visit_cell(runtime, cell, cell);
            bit = if cell_end < self.covered_end {
                self.bit_index_of(cell_end)
            } else {
                self.num_bits
            };
        }
    }

    /// Pop and visit deferred cells until the stack is empty. Cells that
    /// were blackened after being pushed are skipped.
    fn drain_deferred<R: Runtime>(&mut self, runtime: &R) {
        while let Some(cell) = self.stack.pop() {
            if self.color_of(cell) != Color::Grey {
                continue;
            }
            self.visit_cell(runtime, cell, self.finger);
        }
    }

    /// The drain phase proper: after the forward scan the finger sits at the
    /// end of the covered area, so every newly greyed reference is deferred
    /// and drained here, with overflow recovery in the loop.
    fn drain<R: Runtime>(&mut self, runtime: &R) {
        self.phase = MarkPhase::Drain;
        debug_assert!(self.finger == self.covered_end);
        loop {
            self.drain_deferred(runtime);
            if self.overflow_pending {
                self.recover_from_overflow(runtime);
                self.phase = MarkPhase::Drain;
                continue;
            }
            if self.stack.is_empty() {
                break;
            }
        }
    }

    /// A grey mark surviving the drain phase means the tracer lost an
    /// object; continuing would free a reachable cell.
    fn assert_no_grey_left(&self) {
        if self.num_bits == 0 {
            return;
        }
        if let Some(bit) = self.next_grey(0, self.num_bits - 1) {
            panic!(
                "grey mark left behind the finger after drain: cell {}",
                self.address_of_bit(bit)
            );
        }
    }

    // ---- sweeping ---------------------------------------------------------

    /// Iterate the live (black) cells left by [`Self::mark_all`].
    pub fn live_cells(&self) -> LiveCells<'_> {
        LiveCells {
            marker: self,
            cursor: 0,
        }
    }

    /// Precise sweep: report every live cell to the sweeper, which tracks
    /// the dead intervals between successive cells itself.
    pub fn sweep_precise<S: Sweeper>(&mut self, sweeper: &mut S) {
        debug_assert!(self.phase == MarkPhase::Idle);
        self.phase = MarkPhase::Sweep;
        let last_bit = self.num_bits.saturating_sub(1);
        let mut bit = 0;
        while let Some(set) = self.next_set_bit(bit, last_bit) {
            let cell = self.address_of_bit(set);
            let end = sweeper.process_live_object(cell);
            debug_assert!(end > cell);
            bit = set + 1;
        }
        self.phase = MarkPhase::Idle;
    }

    /// Imprecise sweep: report only inter-cell gaps of at least
    /// `min_reclaimable` bytes, filling shorter gaps with dead space in
    /// place. The intervals before the first live cell and after the last
    /// one are reported as dead space.
    pub fn sweep_imprecise<R: Runtime, S: Sweeper>(
        &mut self,
        runtime: &R,
        sweeper: &mut S,
        min_reclaimable: usize,
    ) {
        debug_assert!(self.phase == MarkPhase::Idle);
        self.phase = MarkPhase::Sweep;
        let last_bit = self.num_bits.saturating_sub(1);
        let mut prev_end = self.covered_start;
        let mut seen_live = false;
        let mut bit = 0;
        while let Some(set) = self.next_set_bit(bit, last_bit) {
            let cell = self.address_of_bit(set);
            let gap = cell - prev_end;
            if !seen_live {
                if gap > 0 {
                    sweeper.process_dead_space(prev_end, gap);
                }
                seen_live = true;
            } else if gap >= min_reclaimable {
                sweeper.process_large_gap(prev_end, cell);
            } else if gap > 0 {
                free_chunk::fill_dead_space(prev_end, gap);
            }
            prev_end = cell + runtime.size_of(cell);
            bit = set + 1;
        }
        if self.covered_end > prev_end {
            sweeper.process_dead_space(prev_end, self.covered_end - prev_end);
        }
        self.phase = MarkPhase::Idle;
    }
}

/// Marks roots grey. Roots are not pushed: the forward scan starts from the
/// leftmost mark and finds them all.
struct RootMarkVisitor<'m> {
    marker: &'m mut TricolorHeapMarker,
}

impl RootVisitor for RootMarkVisitor<'_> {
    fn visit_slot(&mut self, slot: Address) {
        let target: Address = unsafe { slot.load() };
        self.visit_cell(target);
    }

    fn visit_cell(&mut self, cell: Address) {
        if cell.is_zero() || !self.marker.covers(cell) {
            return;
        }
        self.marker.mark_grey_if_white(cell);
    }
}

/// Pull-based iterator over the black cells of the map.
pub struct LiveCells<'m> {
    marker: &'m TricolorHeapMarker,
    cursor: usize,
}

impl Iterator for LiveCells<'_> {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        let last_bit = self.marker.num_bits.checked_sub(1)?;
        let bit = self.marker.next_set_bit(self.cursor, last_bit)?;
        self.cursor = bit + 1;
        Some(self.marker.address_of_bit(bit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_WORD;
    use crate::vm::ObjectLayout;
    use std::collections::HashMap;

    /// A heap of word-sized slots in a plain buffer: every object is a
    /// tuple whose first word is a fake hub and whose remaining words are
    /// all reference slots.
    struct MiniHeap {
        buffer: Vec<usize>,
        base: Address,
        /// word offset of cell -> (size bytes, reference slot byte offsets)
        objects: HashMap<usize, (usize, Vec<usize>)>,
        roots: Vec<Address>,
    }

    impl MiniHeap {
        fn new(words: usize) -> MiniHeap {
            let buffer = vec![0usize; words];
            let base = Address::from_ptr(buffer.as_ptr());
            MiniHeap {
                buffer,
                base,
                objects: HashMap::new(),
                roots: Vec::new(),
            }
        }

        fn end(&self) -> Address {
            self.base + self.buffer.len() * BYTES_IN_WORD
        }

        /// Lay out an object of `words` words at the given word offset.
        /// Word 0 holds a hub stand-in; words 1.. are reference slots.
        fn object(&mut self, word_offset: usize, words: usize) -> Address {
            assert!(words >= 2);
            let ref_offsets: Vec<usize> = (1..words).map(|i| i * BYTES_IN_WORD).collect();
            self.objects
                .insert(word_offset, (words * BYTES_IN_WORD, ref_offsets));
            self.base + word_offset * BYTES_IN_WORD
        }

        fn link(&mut self, from: Address, slot: usize, to: Address) {
            let word = (from - self.base) / BYTES_IN_WORD + slot;
            self.buffer[word] = to.as_usize();
        }

        fn root(&mut self, cell: Address) {
            self.roots.push(cell);
        }

        fn marker(&self, stack_capacity: usize, strategy: OverflowStrategy, deep: bool) -> TricolorHeapMarker {
            TricolorHeapMarker::with_config(
                self.base,
                self.end(),
                1,
                stack_capacity,
                strategy,
                deep,
                12, // 4 KiB rescan granules
            )
        }
    }

    impl Runtime for MiniHeap {
        fn size_of(&self, cell: Address) -> usize {
            self.objects[&((cell - self.base) / BYTES_IN_WORD)].0
        }

        fn hub_of(&self, cell: Address) -> Address {
            cell
        }

        fn layout_of(&self, cell: Address) -> ObjectLayout<'_> {
            let (_, offsets) = &self.objects[&((cell - self.base) / BYTES_IN_WORD)];
            ObjectLayout::Tuple {
                ref_offsets: offsets,
            }
        }

        fn enumerate_roots(&self, visitor: &mut dyn RootVisitor) {
            for &root in &self.roots {
                visitor.visit_cell(root);
            }
        }
    }

    #[test]
    fn colors_round_trip() {
        let heap = MiniHeap::new(256);
        let mut marker = heap.marker(64, OverflowStrategy::LinearRescan, false);
        let cell = heap.base + 4 * BYTES_IN_WORD;
        assert!(marker.is_white(cell));
        assert!(marker.mark_grey_if_white(cell));
        assert_eq!(marker.color_of(cell), Color::Grey);
        assert!(!marker.mark_grey_if_white(cell));
        marker.blacken(cell);
        assert_eq!(marker.color_of(cell), Color::Black);
        assert!(marker.is_black_when_no_greys(marker.bit_index_of(cell)));
    }

    #[test]
    fn cross_word_color_detected() {
        // A cell whose leading bit index is exactly 63: the grey pair spans
        // two bitmap words.
        let heap = MiniHeap::new(256);
        let mut marker = heap.marker(64, OverflowStrategy::LinearRescan, false);
        let cell = heap.base + 63 * BYTES_IN_WORD;
        assert_eq!(marker.bit_index_of(cell), 63);
        marker.mark_grey(cell);
        assert!(marker.is_grey(63));
        assert_eq!(marker.color_at(63), Color::Grey);
        // The word-at-a-time search takes the cross-word path to find it.
        assert_eq!(marker.next_grey(0, 63), Some(63));
        marker.blacken(cell);
        assert_eq!(marker.color_at(63), Color::Black);
        assert_eq!(marker.next_grey(0, 63), None);
    }

    #[test]
    fn chain_is_marked_black() {
        let mut heap = MiniHeap::new(256);
        let a = heap.object(0, 4);
        let b = heap.object(8, 4);
        let c = heap.object(16, 4);
        let d = heap.object(24, 4); // unreachable
        heap.link(a, 1, b);
        heap.link(b, 1, c);
        heap.root(a);
        let mut marker = heap.marker(64, OverflowStrategy::LinearRescan, false);
        marker.mark_all(&heap);
        assert_eq!(marker.color_of(a), Color::Black);
        assert_eq!(marker.color_of(b), Color::Black);
        assert_eq!(marker.color_of(c), Color::Black);
        assert_eq!(marker.color_of(d), Color::White);
        assert_eq!(marker.stats().cells_visited, 3);
        let live: Vec<Address> = marker.live_cells().collect();
        assert_eq!(live, vec![a, b, c]);
    }

    #[test]
    fn backward_reference_goes_through_stack() {
        let mut heap = MiniHeap::new(256);
        let low = heap.object(0, 4);
        let mid = heap.object(16, 4);
        let high = heap.object(32, 4);
        // high -> low is a backward reference once the finger passed low.
        heap.link(mid, 1, high);
        heap.link(high, 1, low);
        heap.root(mid);
        let mut marker = heap.marker(64, OverflowStrategy::LinearRescan, false);
        marker.mark_all(&heap);
        for cell in [low, mid, high] {
            assert_eq!(marker.color_of(cell), Color::Black);
        }
    }

    /// A graph that forces marking-stack overflow: `n` small cells chained
    /// backward at the bottom of the heap, all additionally referenced by
    /// one wide cell at the top. Visiting the wide cell pushes `n` backward
    /// references in one go, and the recovery scan keeps pushing as it walks
    /// the backward chain.
    fn fan_in(heap: &mut MiniHeap, n: usize) -> Vec<Address> {
        let mut low: Vec<Address> = (0..n).map(|i| heap.object(i * 4, 4)).collect();
        for i in 1..n {
            heap.link(low[i], 1, low[i - 1]);
        }
        let wide = heap.object(n * 4, n + 1);
        for (i, &cell) in low.iter().enumerate() {
            heap.link(wide, 1 + i, cell);
        }
        heap.root(wide);
        low.push(wide);
        low
    }

    #[test]
    fn overflow_linear_rescan_recovers() {
        let mut heap = MiniHeap::new(4096);
        let addrs = fan_in(&mut heap, 600);
        let mut marker = heap.marker(8, OverflowStrategy::LinearRescan, false);
        marker.mark_all(&heap);
        for &cell in &addrs {
            assert_eq!(marker.color_of(cell), Color::Black, "cell {cell}");
        }
        assert!(marker.stats().overflows >= 1);
        assert!(marker.stats().recovery_scans >= 1);
    }

    #[test]
    fn overflow_deep_flush_recovers() {
        let mut heap = MiniHeap::new(4096);
        let addrs = fan_in(&mut heap, 600);
        let mut marker = heap.marker(8, OverflowStrategy::LinearRescan, true);
        marker.mark_all(&heap);
        for &cell in &addrs {
            assert_eq!(marker.color_of(cell), Color::Black, "cell {cell}");
        }
        assert!(marker.stats().overflows >= 1);
    }

    #[test]
    fn overflow_rescan_map_recovers() {
        let mut heap = MiniHeap::new(4096);
        let addrs = fan_in(&mut heap, 600);
        let mut marker = heap.marker(8, OverflowStrategy::RescanMap, false);
        marker.mark_all(&heap);
        for &cell in &addrs {
            assert_eq!(marker.color_of(cell), Color::Black, "cell {cell}");
        }
        assert!(marker.stats().overflows >= 1);
        assert!(marker.stats().recovery_scans >= 1);
    }

    #[test]
    fn overflow_at_capacity_boundaries() {
        // Fan-in of capacity-1, capacity and capacity+1 backward references:
        // the flush fires at most once per push and the retried push
        // succeeds, so marking always completes.
        for n in [7usize, 8, 9] {
            let mut heap = MiniHeap::new(1024);
            let addrs = fan_in(&mut heap, n);
            let mut marker = heap.marker(8, OverflowStrategy::LinearRescan, false);
            marker.mark_all(&heap);
            for &cell in &addrs {
                assert_eq!(marker.color_of(cell), Color::Black);
            }
            if n <= 8 {
                // The stack fills exactly to capacity without spilling.
                assert_eq!(marker.stats().overflows, 0);
            } else {
                assert!(marker.stats().overflows >= 1);
            }
        }
    }

    #[test]
    fn mark_twice_is_idempotent() {
        let mut heap = MiniHeap::new(512);
        let a = heap.object(0, 4);
        let b = heap.object(8, 6);
        heap.link(a, 2, b);
        heap.root(a);
        let mut marker = heap.marker(64, OverflowStrategy::LinearRescan, false);
        marker.mark_all(&heap);
        let first = marker.words.clone();
        marker.mark_all(&heap);
        assert_eq!(marker.words, first);
    }

    #[derive(Default)]
    struct RecordingSweeper {
        live: Vec<Address>,
        live_sizes: HashMap<usize, usize>,
        large_gaps: Vec<(Address, Address)>,
        dead_spaces: Vec<(Address, usize)>,
    }

    impl RecordingSweeper {
        fn with_sizes(heap: &MiniHeap) -> RecordingSweeper {
            RecordingSweeper {
                live_sizes: heap
                    .objects
                    .iter()
                    .map(|(off, (size, _))| (heap.base.as_usize() + off * BYTES_IN_WORD, *size))
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl Sweeper for RecordingSweeper {
        fn process_live_object(&mut self, cell: Address) -> Address {
            self.live.push(cell);
            cell + self.live_sizes[&cell.as_usize()]
        }

        fn process_large_gap(&mut self, left_end: Address, right_start: Address) {
            self.large_gaps.push((left_end, right_start));
        }

        fn process_dead_space(&mut self, start: Address, bytes: usize) {
            self.dead_spaces.push((start, bytes));
        }
    }

    #[test]
    fn precise_sweep_reports_every_live_cell() {
        let mut heap = MiniHeap::new(512);
        let a = heap.object(0, 4);
        let b = heap.object(64, 4);
        let c = heap.object(128, 4);
        heap.link(a, 1, b);
        heap.link(b, 1, c);
        heap.root(a);
        let mut marker = heap.marker(64, OverflowStrategy::LinearRescan, false);
        marker.mark_all(&heap);
        let mut sweeper = RecordingSweeper::with_sizes(&heap);
        marker.sweep_precise(&mut sweeper);
        assert_eq!(sweeper.live, vec![a, b, c]);
        assert!(sweeper.large_gaps.is_empty());
    }

    #[test]
    fn imprecise_sweep_thresholds_gaps() {
        // live[4w] gap[12w] live[4w] gap[60w] live[4w] tail...
        let mut heap = MiniHeap::new(512);
        let a = heap.object(0, 4);
        let b = heap.object(16, 4);
        let c = heap.object(80, 4);
        heap.link(a, 1, b);
        heap.link(a, 2, c);
        heap.root(a);
        let mut marker = heap.marker(64, OverflowStrategy::LinearRescan, false);
        marker.mark_all(&heap);
        let mut sweeper = RecordingSweeper::with_sizes(&heap);
        // 256-byte threshold: only the 60-word (480-byte) gap qualifies.
        marker.sweep_imprecise(&heap, &mut sweeper, 256);
        assert!(sweeper.live.is_empty());
        assert_eq!(
            sweeper.large_gaps,
            vec![(b + 4 * BYTES_IN_WORD, c)]
        );
        // One dead interval: the tail after the last live cell.
        assert_eq!(
            sweeper.dead_spaces,
            vec![(c + 4 * BYTES_IN_WORD, heap.end() - (c + 4 * BYTES_IN_WORD))]
        );
        // The sub-threshold gap was filled with dead space in place.
        assert!(free_chunk::is_dead_space(a + 4 * BYTES_IN_WORD));
    }
}

