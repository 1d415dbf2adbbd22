//! Contiguous block allocator.
//!
//! The allocator manages a fixed pool of equal-size block slots over a
//! bit-map and hands out contiguous runs as [`KvHandle`]s. First-fit linear
//! scan; allocation is all-or-nothing.
//!
//! ## Example
//!
//! ```
//! use cortexstream::core::allocator::BlockAllocator;
//!
//! let mut allocator = BlockAllocator::new(64);
//!
//! let handle = allocator.allocate(4).unwrap();
//! assert_eq!(handle.num_blocks, 4);
//! assert_eq!(allocator.free_blocks(), 60);
//!
//! allocator.free(handle);
//! assert_eq!(allocator.free_blocks(), 64);
//! ```

use std::io::Write;

use tracing::warn;

use crate::core::block::KvHandle;
use crate::error::{Error, Result};

/// Blocks per line in [`BlockAllocator::dump_block_map`].
const MAP_LINE_WIDTH: usize = 64;

/// Manages a fixed pool of block slots, handing out contiguous runs.
#[derive(Debug)]
pub struct BlockAllocator {
    /// `true` = slot in use.
    used: Vec<bool>,
}

impl BlockAllocator {
    /// Create an allocator with all `total_blocks` slots free.
    pub fn new(total_blocks: usize) -> Self {
        Self {
            used: vec![false; total_blocks],
        }
    }

    /// Total number of slots.
    pub fn total_blocks(&self) -> usize {
        self.used.len()
    }

    /// Number of free slots. Derived from the bit-map, never cached.
    pub fn free_blocks(&self) -> usize {
        self.used.iter().filter(|&&u| !u).count()
    }

    /// Number of used slots.
    pub fn used_blocks(&self) -> usize {
        self.used.iter().filter(|&&u| u).count()
    }

    /// Whether a run of `n_blocks` contiguous free slots exists.
    pub fn can_allocate(&self, n_blocks: usize) -> bool {
        n_blocks == 0 || self.find_run(n_blocks).is_some()
    }

    /// Allocate a contiguous run of `n_blocks` slots.
    ///
    /// Either the whole run is marked used and returned, or nothing changes.
    /// A request for zero blocks succeeds with an empty handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocatorOom`] when no contiguous free run of
    /// `n_blocks` exists.
    pub fn allocate(&mut self, n_blocks: usize) -> Result<KvHandle> {
        if n_blocks == 0 {
            return Ok(KvHandle::empty());
        }
        let start = self.find_run(n_blocks).ok_or(Error::AllocatorOom {
            requested: n_blocks,
            free: self.free_blocks(),
        })?;
        for slot in &mut self.used[start..start + n_blocks] {
            *slot = true;
        }
        Ok(KvHandle::new(start, n_blocks))
    }

    /// Return a run of blocks to the pool.
    ///
    /// Freeing the empty handle is a no-op. Double-freeing a live handle is
    /// a logic error, caught by assertion in debug builds.
    pub fn free(&mut self, handle: KvHandle) {
        if handle.is_empty() {
            return;
        }
        debug_assert!(
            handle.end_block() <= self.used.len(),
            "handle [{}, {}) out of range",
            handle.start_block,
            handle.end_block()
        );
        debug_assert!(
            self.used[handle.start_block..handle.end_block()]
                .iter()
                .all(|&u| u),
            "double free of blocks [{}, {})",
            handle.start_block,
            handle.end_block()
        );
        if handle.end_block() > self.used.len() {
            warn!(
                start = handle.start_block,
                num = handle.num_blocks,
                "ignoring free of out-of-range handle"
            );
            return;
        }
        for slot in &mut self.used[handle.start_block..handle.end_block()] {
            *slot = false;
        }
    }

    /// Length of the largest contiguous free run.
    pub fn largest_free_run(&self) -> usize {
        let mut largest = 0;
        let mut current = 0;
        for &used in &self.used {
            if used {
                current = 0;
            } else {
                current += 1;
                largest = largest.max(current);
            }
        }
        largest
    }

    /// Fragmentation metric: `1 - largest_free_run / free_blocks`.
    ///
    /// 0.0 when the pool has no free blocks at all.
    pub fn fragmentation(&self) -> f64 {
        let free = self.free_blocks();
        if free == 0 {
            return 0.0;
        }
        1.0 - self.largest_free_run() as f64 / free as f64
    }

    /// Write a human-readable block map: `.` free, `X` used, 64 per line.
    pub fn dump_block_map(&self, writer: &mut impl Write) -> std::io::Result<()> {
        for chunk in self.used.chunks(MAP_LINE_WIDTH) {
            let line: String = chunk.iter().map(|&u| if u { 'X' } else { '.' }).collect();
            writeln!(writer, "{line}")?;
        }
        Ok(())
    }

    /// First-fit scan for a free run of `n_blocks`.
    fn find_run(&self, n_blocks: usize) -> Option<usize> {
        if n_blocks > self.used.len() {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for (i, &used) in self.used.iter().enumerate() {
            if used {
                run_len = 0;
                run_start = i + 1;
            } else {
                run_len += 1;
                if run_len == n_blocks {
                    return Some(run_start);
                }
            }
        }
        None
    }
}
