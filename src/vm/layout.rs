//! The object layout oracle.
//!
//! Object shapes are described by a tagged variant rather than a class
//! hierarchy: the tracer reads the tag once per visited cell and then walks
//! reference slots with no further dispatch.

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// The reference layout of a cell. All offsets are byte offsets from the
/// cell address and must be word-aligned.
#[derive(Debug, Clone, Copy)]
pub enum ObjectLayout<'a> {
    /// A fixed-shape object whose reference slots sit at the given offsets.
    Tuple {
        /// Byte offsets of the reference slots.
        ref_offsets: &'a [usize],
    },
    /// An array of references. The element count is stored in the cell at
    /// `length_offset`; elements are consecutive words from
    /// `elements_offset`.
    RefArray {
        length_offset: usize,
        elements_offset: usize,
    },
    /// A fixed reference part followed by a trailing reference array.
    Hybrid {
        ref_offsets: &'a [usize],
        length_offset: usize,
        elements_offset: usize,
    },
    /// No outgoing references.
    Primitive,
}

/// Invoke `f` with the address of every reference slot of the cell.
pub fn for_each_reference_slot(
    cell: Address,
    layout: ObjectLayout<'_>,
    mut f: impl FnMut(Address),
) {
    match layout {
        ObjectLayout::Tuple { ref_offsets } => {
            for &offset in ref_offsets {
                f(cell + offset);
            }
        }
        ObjectLayout::RefArray {
            length_offset,
            elements_offset,
        } => {
            let length = unsafe { (cell + length_offset).load::<usize>() };
            for i in 0..length {
                f(cell + elements_offset + i * BYTES_IN_WORD);
            }
        }
        ObjectLayout::Hybrid {
            ref_offsets,
            length_offset,
            elements_offset,
        } => {
            for &offset in ref_offsets {
                f(cell + offset);
            }
            let length = unsafe { (cell + length_offset).load::<usize>() };
            for i in 0..length {
                f(cell + elements_offset + i * BYTES_IN_WORD);
            }
        }
        ObjectLayout::Primitive => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_slots() {
        let buf = vec![0usize; 8];
        let cell = Address::from_ptr(buf.as_ptr());
        let offsets = [8, 24];
        let mut seen = vec![];
        for_each_reference_slot(cell, ObjectLayout::Tuple { ref_offsets: &offsets }, |s| {
            seen.push(s)
        });
        assert_eq!(seen, vec![cell + 8usize, cell + 24usize]);
    }

    #[test]
    fn ref_array_slots() {
        let mut buf = vec![0usize; 8];
        buf[1] = 3; // length word
        let cell = Address::from_ptr(buf.as_ptr());
        let mut seen = vec![];
        for_each_reference_slot(
            cell,
            ObjectLayout::RefArray {
                length_offset: BYTES_IN_WORD,
                elements_offset: 2 * BYTES_IN_WORD,
            },
            |s| seen.push(s),
        );
        assert_eq!(
            seen,
            vec![
                cell + 2 * BYTES_IN_WORD,
                cell + 3 * BYTES_IN_WORD,
                cell + 4 * BYTES_IN_WORD
            ]
        );
    }

    #[test]
    fn primitive_has_no_slots() {
        let buf = vec![0usize; 2];
        let cell = Address::from_ptr(buf.as_ptr());
        let mut count = 0;
        for_each_reference_slot(cell, ObjectLayout::Primitive, |_| count += 1);
        assert_eq!(count, 0);
    }
}
