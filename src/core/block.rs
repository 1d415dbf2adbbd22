//! Block handles for the paged KV cache.
//!
//! The KV arenas are carved into fixed-size blocks, similar to how operating
//! systems manage physical memory with pages. A [`KvHandle`] names one
//! sequence's contiguous run of blocks.

/// A contiguous run of blocks in the KV arena.
///
/// Produced by the block allocator; a handle with `num_blocks == 0` is a
/// valid empty region (a zero-token sequence owns no blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvHandle {
    /// First block of the run.
    pub start_block: usize,
    /// Number of adjacent blocks.
    pub num_blocks: usize,
}

impl KvHandle {
    pub fn new(start_block: usize, num_blocks: usize) -> Self {
        Self {
            start_block,
            num_blocks,
        }
    }

    /// The empty region.
    pub fn empty() -> Self {
        Self {
            start_block: 0,
            num_blocks: 0,
        }
    }

    /// Whether this handle covers no blocks.
    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }

    /// One past the last block of the run.
    pub fn end_block(&self) -> usize {
        self.start_block + self.num_blocks
    }
}

/// Compute the number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use cortexstream::core::block::blocks_for_tokens;
///
/// assert_eq!(blocks_for_tokens(35, 16), 3);
/// assert_eq!(blocks_for_tokens(32, 16), 2);
/// assert_eq!(blocks_for_tokens(0, 16), 0);
/// ```
pub fn blocks_for_tokens(num_tokens: usize, block_size: usize) -> usize {
    num_tokens.div_ceil(block_size)
}
