//! Alignment and unit conversion helpers.

use crate::util::constants::*;
use crate::util::Address;

/// Align up an integer to the given alignment. `align` must be a power of two.
pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/master/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

/// Align down an integer to the given alignment. `align` must be a power of two.
pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

/// Is the integer aligned to the given alignment? `align` must be a power of two.
pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/// Align up an address to the word size.
pub fn word_align_up(addr: Address) -> Address {
    addr.align_up(BYTES_IN_WORD)
}

/// Is the address word aligned?
pub fn is_word_aligned(addr: Address) -> bool {
    addr.is_aligned_to(BYTES_IN_WORD)
}

/// Align up an address to the page size.
pub fn page_align_up(addr: Address) -> Address {
    addr.align_up(BYTES_IN_PAGE)
}

/// Convert bytes to the number of words the bytes span, rounding up.
pub const fn bytes_to_words_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_WORD) >> LOG_BYTES_IN_WORD
}

/// Convert a number of words to bytes.
pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_BYTES_IN_WORD
}

/// Convert bytes to the number of pages the bytes span, rounding up.
pub const fn bytes_to_pages_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_PAGE) >> LOG_BYTES_IN_PAGE
}

/// Convert a number of pages to bytes.
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(raw_align_up(0, 8), 0);
        assert_eq!(raw_align_up(1, 8), 8);
        assert_eq!(raw_align_up(8, 8), 8);
        assert_eq!(raw_align_up(9, 8), 16);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(raw_align_down(0, 8), 0);
        assert_eq!(raw_align_down(7, 8), 0);
        assert_eq!(raw_align_down(8, 8), 8);
        assert_eq!(raw_align_down(15, 8), 8);
    }

    #[test]
    fn test_is_aligned() {
        assert!(raw_is_aligned(0, 8));
        assert!(raw_is_aligned(16, 8));
        assert!(!raw_is_aligned(9, 8));
    }

    #[test]
    fn test_bytes_to_pages_up() {
        assert_eq!(bytes_to_pages_up(0), 0);
        assert_eq!(bytes_to_pages_up(1), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE + 1), 2);
    }

    #[test]
    fn test_bytes_to_words_up() {
        assert_eq!(bytes_to_words_up(0), 0);
        assert_eq!(bytes_to_words_up(1), 1);
        assert_eq!(bytes_to_words_up(BYTES_IN_WORD), 1);
        assert_eq!(bytes_to_words_up(BYTES_IN_WORD + 1), 2);
    }
}
