//! The heap free chunk format.
//!
//! Dead space that survives a sweep is formatted so that a linear walk of the
//! region can parse it: the first word of a chunk is a tag distinguishing it
//! from a live cell's hub, followed by the chunk size in bytes and the
//! address of the next chunk on the free list. Spans too small to hold the
//! header are filled with a one-word dead-space pattern instead; a walker
//! skips those one word at a time.

use crate::util::constants::{BYTES_IN_WORD, LOG_BYTES_IN_WORD};
use crate::util::Address;

/// Tag word planted at the start of every free chunk.
pub const FREE_CHUNK_MARK: usize = 0xF4EE_C4E0_F4EE_C4E0_u64 as usize;

/// Filler word for dead space too small to carry a chunk header.
pub const DEAD_SPACE_MARK: usize = 0xDEAD_5BAD_DEAD_5BAD_u64 as usize;

/// Words in a chunk header: tag, size, next.
pub const HEADER_WORDS: usize = 3;
/// Bytes in a chunk header; the smallest span that can be chunk-formatted.
pub const HEADER_BYTES: usize = HEADER_WORDS * BYTES_IN_WORD;

const TAG_OFFSET: usize = 0;
const SIZE_OFFSET: usize = BYTES_IN_WORD;
const NEXT_OFFSET: usize = 2 * BYTES_IN_WORD;

/// A free chunk, identified by its first word. The wrapper owns no memory;
/// it reads and writes the chunk header in place.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapFreeChunk(Address);

impl HeapFreeChunk {
    /// Wrap a chunk address. Zero stands for the end of a free list.
    pub fn from_address(addr: Address) -> HeapFreeChunk {
        HeapFreeChunk(addr)
    }

    pub fn to_address(self) -> Address {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Does `addr` carry the free chunk format?
    pub fn is_valid_chunk(addr: Address) -> bool {
        !addr.is_zero() && unsafe { (addr + TAG_OFFSET).load::<usize>() } == FREE_CHUNK_MARK
    }

    /// Plant the free chunk format on `[addr, addr + size)`. In debug builds
    /// the interior is filled with the dead-space pattern first, so stale
    /// object payloads cannot be mistaken for live data.
    pub fn format(addr: Address, size: usize, next: Address) -> HeapFreeChunk {
        debug_assert!(addr.is_aligned_to(BYTES_IN_WORD));
        debug_assert!(size >= HEADER_BYTES, "span of {size} bytes cannot hold a chunk header");
        debug_assert!(size % BYTES_IN_WORD == 0);
        #[cfg(debug_assertions)]
        fill_dead_space(addr, size);
        unsafe {
            (addr + TAG_OFFSET).store::<usize>(FREE_CHUNK_MARK);
            (addr + SIZE_OFFSET).store::<usize>(size);
            (addr + NEXT_OFFSET).store::<Address>(next);
        }
        HeapFreeChunk(addr)
    }

    /// The chunk size in bytes.
    pub fn size(self) -> usize {
        debug_assert!(Self::is_valid_chunk(self.0));
        unsafe { (self.0 + SIZE_OFFSET).load::<usize>() }
    }

    pub fn set_size(self, size: usize) {
        unsafe { (self.0 + SIZE_OFFSET).store::<usize>(size) }
    }

    /// The next chunk on the free list, or a zero chunk at the end.
    pub fn next(self) -> HeapFreeChunk {
        debug_assert!(Self::is_valid_chunk(self.0));
        HeapFreeChunk(unsafe { (self.0 + NEXT_OFFSET).load::<Address>() })
    }

    pub fn set_next(self, next: HeapFreeChunk) {
        unsafe { (self.0 + NEXT_OFFSET).store::<Address>(next.0) }
    }

    /// The address one past the chunk.
    pub fn end(self) -> Address {
        self.0 + self.size()
    }

    /// Linear first-fit over the singly linked list starting at `head`:
    /// the first chunk with size >= `size`, or a zero chunk.
    pub fn first_fit(head: HeapFreeChunk, size: usize) -> HeapFreeChunk {
        let mut chunk = head;
        while !chunk.is_zero() {
            if chunk.size() >= size {
                return chunk;
            }
            chunk = chunk.next();
        }
        chunk
    }

    /// Unlink and return the first chunk of the list, updating `head`.
    /// Returns a zero chunk if the list is empty.
    pub fn remove_first(head: &mut HeapFreeChunk) -> HeapFreeChunk {
        let first = *head;
        if !first.is_zero() {
            *head = first.next();
        }
        first
    }

    /// Unlink and return the first chunk with size >= `size`, or a zero
    /// chunk if none fits.
    pub fn remove_first_fit(head: &mut HeapFreeChunk, size: usize) -> HeapFreeChunk {
        let mut prev = HeapFreeChunk::from_address(unsafe { Address::zero() });
        let mut chunk = *head;
        while !chunk.is_zero() {
            if chunk.size() >= size {
                if prev.is_zero() {
                    *head = chunk.next();
                } else {
                    prev.set_next(chunk.next());
                }
                return chunk;
            }
            prev = chunk;
            chunk = chunk.next();
        }
        chunk
    }

    /// Carve the tail of this chunk off as a new free chunk, leaving
    /// `left_size` bytes in this chunk. The new right chunk is linked to
    /// `next`. Returns the right chunk.
    pub fn split_right(self, left_size: usize, next: HeapFreeChunk) -> HeapFreeChunk {
        let total = self.size();
        debug_assert!(left_size >= HEADER_BYTES);
        debug_assert!(total >= left_size + HEADER_BYTES);
        let right = HeapFreeChunk::format(self.0 + left_size, total - left_size, next.0);
        self.set_size(left_size);
        right
    }

    /// Replace every chunk of the list with dead-space filler, so the
    /// affected regions become walkable by size alone with no free-list
    /// knowledge. Returns the number of chunks erased.
    pub fn make_parsable(head: HeapFreeChunk) -> usize {
        let mut chunk = head;
        let mut erased = 0;
        while !chunk.is_zero() {
            let next = chunk.next();
            let size = chunk.size();
            fill_dead_space(chunk.0, size);
            chunk = next;
            erased += 1;
        }
        erased
    }

    /// Total bytes across the list.
    pub fn total_bytes(head: HeapFreeChunk) -> usize {
        let mut chunk = head;
        let mut total = 0;
        while !chunk.is_zero() {
            total += chunk.size();
            chunk = chunk.next();
        }
        total
    }

    /// Number of chunks on the list.
    pub fn count(head: HeapFreeChunk) -> usize {
        let mut chunk = head;
        let mut n = 0;
        while !chunk.is_zero() {
            n += 1;
            chunk = chunk.next();
        }
        n
    }
}

/// Fill `[start, start + bytes)` with the dead-space pattern.
pub fn fill_dead_space(start: Address, bytes: usize) {
    debug_assert!(start.is_aligned_to(BYTES_IN_WORD));
    debug_assert!(bytes % BYTES_IN_WORD == 0);
    for word in start.iter_to(start + bytes, BYTES_IN_WORD) {
        unsafe { word.store::<usize>(DEAD_SPACE_MARK) };
    }
}

/// Is the word at `addr` dead-space filler?
pub fn is_dead_space(addr: Address) -> bool {
    unsafe { addr.load::<usize>() == DEAD_SPACE_MARK }
}

/// The number of words `bytes` of dead space spans.
pub fn dead_space_words(bytes: usize) -> usize {
    bytes >> LOG_BYTES_IN_WORD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(words: usize) -> (Vec<usize>, Address) {
        let buf = vec![0usize; words];
        let base = Address::from_ptr(buf.as_ptr());
        (buf, base)
    }

    #[test]
    fn format_is_valid() {
        let (_buf, base) = buffer(32);
        let chunk = HeapFreeChunk::format(base, 8 * BYTES_IN_WORD, unsafe { Address::zero() });
        assert!(HeapFreeChunk::is_valid_chunk(base));
        assert_eq!(chunk.size(), 8 * BYTES_IN_WORD);
        assert!(chunk.next().is_zero());
        assert_eq!(chunk.end(), base + 8 * BYTES_IN_WORD);
    }

    #[test]
    fn first_fit_picks_first_large_enough() {
        let (_buf, base) = buffer(64);
        // Three chunks of 4, 8 and 16 words.
        let c2 = HeapFreeChunk::format(base + 12 * BYTES_IN_WORD, 16 * BYTES_IN_WORD, unsafe {
            Address::zero()
        });
        let c1 = HeapFreeChunk::format(base + 4 * BYTES_IN_WORD, 8 * BYTES_IN_WORD, c2.to_address());
        let c0 = HeapFreeChunk::format(base, 4 * BYTES_IN_WORD, c1.to_address());

        assert_eq!(HeapFreeChunk::first_fit(c0, 4 * BYTES_IN_WORD), c0);
        assert_eq!(HeapFreeChunk::first_fit(c0, 6 * BYTES_IN_WORD), c1);
        assert_eq!(HeapFreeChunk::first_fit(c0, 12 * BYTES_IN_WORD), c2);
        assert!(HeapFreeChunk::first_fit(c0, 17 * BYTES_IN_WORD).is_zero());
    }

    #[test]
    fn remove_first_fit_unlinks() {
        let (_buf, base) = buffer(64);
        let c1 = HeapFreeChunk::format(base + 8 * BYTES_IN_WORD, 16 * BYTES_IN_WORD, unsafe {
            Address::zero()
        });
        let c0 = HeapFreeChunk::format(base, 4 * BYTES_IN_WORD, c1.to_address());

        let mut head = c0;
        let got = HeapFreeChunk::remove_first_fit(&mut head, 10 * BYTES_IN_WORD);
        assert_eq!(got, c1);
        assert_eq!(head, c0);
        assert!(c0.next().is_zero());
        assert_eq!(HeapFreeChunk::count(head), 1);
    }

    #[test]
    fn split_right_carves_tail() {
        let (_buf, base) = buffer(32);
        let chunk = HeapFreeChunk::format(base, 16 * BYTES_IN_WORD, unsafe { Address::zero() });
        let right = chunk.split_right(6 * BYTES_IN_WORD, HeapFreeChunk::from_address(unsafe {
            Address::zero()
        }));
        assert_eq!(chunk.size(), 6 * BYTES_IN_WORD);
        assert_eq!(right.to_address(), base + 6 * BYTES_IN_WORD);
        assert_eq!(right.size(), 10 * BYTES_IN_WORD);
        assert!(HeapFreeChunk::is_valid_chunk(right.to_address()));
    }

    #[test]
    fn make_parsable_erases_headers() {
        let (_buf, base) = buffer(32);
        let c1 = HeapFreeChunk::format(base + 8 * BYTES_IN_WORD, 8 * BYTES_IN_WORD, unsafe {
            Address::zero()
        });
        let c0 = HeapFreeChunk::format(base, 4 * BYTES_IN_WORD, c1.to_address());
        assert_eq!(HeapFreeChunk::make_parsable(c0), 2);
        assert!(!HeapFreeChunk::is_valid_chunk(base));
        assert!(is_dead_space(base));
        assert!(is_dead_space(base + 8 * BYTES_IN_WORD));
    }

    #[test]
    fn dead_space_fill_round_trip() {
        let (_buf, base) = buffer(8);
        fill_dead_space(base, 8 * BYTES_IN_WORD);
        for word in base.iter_to(base + 8 * BYTES_IN_WORD, BYTES_IN_WORD) {
            assert!(is_dead_space(word));
        }
    }
}
