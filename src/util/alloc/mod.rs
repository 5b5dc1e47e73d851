//! Allocators: the word-aligned linear bump allocator and the multi-chunk
//! thread-local allocation buffer (TLAB) allocator built on top of it.

pub mod linear_allocator;
pub mod tlab_allocator;

pub use linear_allocator::{LinearAllocator, RefillManager};
pub use tlab_allocator::{MultiChunkTlabAllocator, TlabRefillManager};
