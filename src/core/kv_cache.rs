//! Paged KV cache.
//!
//! The cache owns two fixed-size arenas (K and V) plus the block allocator,
//! and maps each active request id to its block region. Attention state for
//! a sequence is exposed as zero-copy views into the arenas.
//!
//! ## Memory layout
//!
//! Each arena is one flat `f32` buffer in row-major order:
//!
//! `[num_layers, total_blocks, num_heads, block_size, head_dim]`
//!
//! The element index for (layer, block, head, offset, d) is
//! `layer*B*H*S*D + block*H*S*D + head*S*D + offset*D + d`, with
//! `block = handle.start_block + token/block_size` and
//! `offset = token % block_size`.

use std::collections::HashMap;
use std::io::Write;

use tracing::{debug, warn};

use crate::config::KvCacheConfig;
use crate::core::allocator::BlockAllocator;
use crate::core::block::{blocks_for_tokens, KvHandle};
use crate::error::Result;

/// Page size used by [`KvCache::warmup`] to touch the arenas.
const PAGE_SIZE_BYTES: usize = 4096;

/// Per-request cache state.
#[derive(Debug, Clone, Copy)]
pub struct SequenceKvEntry {
    /// The contiguous block region owned by this sequence.
    pub handle: KvHandle,
    /// Tokens written so far (prompt + generated).
    pub tokens_used: usize,
    /// Capacity of the region: `handle.num_blocks * block_size`.
    pub max_allowed: usize,
}

/// Borrowed view into one sequence's K or V state for a single layer.
///
/// The view borrows the cache, so it cannot outlive the next mutation of
/// the sequence (`append_token`, `free_for`) - the borrow checker enforces
/// the validity window.
#[derive(Debug, Clone, Copy)]
pub struct KvView<'a> {
    data: &'a [f32],
    num_heads: usize,
    tokens: usize,
    head_dim: usize,
}

impl<'a> KvView<'a> {
    /// The underlying arena slice, starting at this sequence's first
    /// element in the layer and covering its whole block region.
    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// Logical shape `[num_heads, tokens_used, head_dim]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.num_heads, self.tokens, self.head_dim]
    }
}

/// Block-structured KV cache over a pre-allocated arena pair.
pub struct KvCache {
    config: KvCacheConfig,
    total_blocks: usize,
    allocator: BlockAllocator,
    k_arena: Vec<f32>,
    v_arena: Vec<f32>,
    sequences: HashMap<String, SequenceKvEntry>,
}

impl KvCache {
    /// Allocate both arenas and carve them into blocks.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] when any dimension is zero.
    pub fn new(config: KvCacheConfig) -> Result<Self> {
        config.validate()?;
        let total_blocks = config.total_blocks();
        let arena_len = config.num_layers
            * total_blocks
            * config.num_heads
            * config.block_size
            * config.head_dim;
        debug!(
            total_blocks,
            arena_bytes = arena_len * std::mem::size_of::<f32>() * 2,
            "allocating KV arenas"
        );
        Ok(Self {
            allocator: BlockAllocator::new(total_blocks),
            k_arena: vec![0.0; arena_len],
            v_arena: vec![0.0; arena_len],
            sequences: HashMap::new(),
            total_blocks,
            config,
        })
    }

    /// Touch every OS page of both arenas so the hot path never takes a
    /// lazy-fault stall.
    pub fn warmup(&mut self) {
        let stride = PAGE_SIZE_BYTES / std::mem::size_of::<f32>();
        let mut i = 0;
        while i < self.k_arena.len() {
            self.k_arena[i] = 0.0;
            self.v_arena[i] = 0.0;
            i += stride;
        }
    }

    // ========== Sequence management ==========

    /// Reserve blocks for a new sequence of `initial_tokens` tokens.
    ///
    /// Returns `false` when the id is already present or no contiguous
    /// region of the required size exists. Never allocates twice for the
    /// same id.
    pub fn allocate_for(&mut self, request_id: &str, initial_tokens: usize) -> bool {
        if self.sequences.contains_key(request_id) {
            warn!(request_id, "allocate_for called twice for the same id");
            return false;
        }
        let blocks_needed = blocks_for_tokens(initial_tokens, self.config.block_size);
        let handle = match self.allocator.allocate(blocks_needed) {
            Ok(handle) => handle,
            Err(err) => {
                debug!(request_id, %err, "KV allocation failed");
                return false;
            }
        };
        self.sequences.insert(
            request_id.to_string(),
            SequenceKvEntry {
                handle,
                tokens_used: initial_tokens,
                max_allowed: handle.num_blocks * self.config.block_size,
            },
        );
        true
    }

    /// Release a sequence's blocks and forget it. Unknown ids are a no-op.
    pub fn free_for(&mut self, request_id: &str) {
        if let Some(entry) = self.sequences.remove(request_id) {
            self.allocator.free(entry.handle);
        }
    }

    /// Record one more token for the sequence.
    ///
    /// Returns `false` when the region is already at capacity (the caller
    /// treats that as a terminal "capacity" stop) or the id is unknown.
    pub fn append_token(&mut self, request_id: &str) -> bool {
        match self.sequences.get_mut(request_id) {
            Some(entry) if entry.tokens_used < entry.max_allowed => {
                entry.tokens_used += 1;
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    /// Slot of the most recently appended token within its block, i.e.
    /// `tokens_used % block_size`. `None` for unknown ids.
    pub fn token_offset_in_block(&self, request_id: &str) -> Option<usize> {
        self.sequences
            .get(request_id)
            .map(|entry| entry.tokens_used % self.config.block_size)
    }

    /// Per-sequence entry, if present.
    pub fn entry(&self, request_id: &str) -> Option<&SequenceKvEntry> {
        self.sequences.get(request_id)
    }

    /// Tokens written for a sequence. `None` for unknown ids.
    pub fn used_tokens(&self, request_id: &str) -> Option<usize> {
        self.sequences.get(request_id).map(|entry| entry.tokens_used)
    }

    // ========== Views ==========

    /// Zero-copy view of a sequence's K state in one layer.
    ///
    /// The slice starts at the first element belonging to this sequence in
    /// that layer; the logical shape is `[num_heads, tokens_used, head_dim]`.
    pub fn k_view(&self, request_id: &str, layer: usize) -> Option<KvView<'_>> {
        self.view_in(&self.k_arena, request_id, layer)
    }

    /// Zero-copy view of a sequence's V state in one layer.
    pub fn v_view(&self, request_id: &str, layer: usize) -> Option<KvView<'_>> {
        self.view_in(&self.v_arena, request_id, layer)
    }

    fn view_in<'a>(
        &self,
        arena: &'a [f32],
        request_id: &str,
        layer: usize,
    ) -> Option<KvView<'a>> {
        if layer >= self.config.num_layers {
            return None;
        }
        let entry = self.sequences.get(request_id)?;
        let block_elems =
            self.config.num_heads * self.config.block_size * self.config.head_dim;
        let layer_elems = self.total_blocks * block_elems;
        let offset = layer * layer_elems + entry.handle.start_block * block_elems;
        let len = entry.handle.num_blocks * block_elems;
        Some(KvView {
            data: &arena[offset..offset + len],
            num_heads: self.config.num_heads,
            tokens: entry.tokens_used,
            head_dim: self.config.head_dim,
        })
    }

    // ========== Observability ==========

    /// Bytes of arena memory (K and V) backing live sequences.
    pub fn total_allocated_bytes(&self) -> usize {
        self.allocator.used_blocks() * self.bytes_per_block()
    }

    /// Bytes of arena memory (K and V) still unassigned.
    pub fn total_free_bytes(&self) -> usize {
        self.allocator.free_blocks() * self.bytes_per_block()
    }

    /// Whether every block is assigned to some sequence.
    pub fn is_full(&self) -> bool {
        self.allocator.free_blocks() == 0
    }

    /// Fragmentation of the underlying block pool.
    pub fn fragmentation(&self) -> f64 {
        self.allocator.fragmentation()
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// The underlying allocator (read-only).
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Write a human-readable summary: pool counters followed by one line
    /// per live sequence.
    pub fn dump_cache_stats(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writeln!(
            writer,
            "total_blocks={} used={} free={} fragmentation={:.2}",
            self.allocator.total_blocks(),
            self.allocator.used_blocks(),
            self.allocator.free_blocks(),
            self.allocator.fragmentation()
        )?;
        let mut ids: Vec<&String> = self.sequences.keys().collect();
        ids.sort();
        for id in ids {
            let entry = &self.sequences[id];
            writeln!(
                writer,
                "  id={} tokens_used={} max_allowed={} start_block={} num_blocks={}",
                id,
                entry.tokens_used,
                entry.max_allowed,
                entry.handle.start_block,
                entry.handle.num_blocks
            )?;
        }
        Ok(())
    }

    fn bytes_per_block(&self) -> usize {
        // K and V arenas both hold one block-sized region per block slot.
        2 * self.config.num_layers
            * self.config.num_heads
            * self.config.block_size
            * self.config.head_dim
            * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> KvCache {
        // 2 layers, 2 heads, head_dim 4, 8 blocks of 4 tokens.
        let config = KvCacheConfig::new(2, 2, 4, 32).with_block_size(4);
        KvCache::new(config).unwrap()
    }

    #[test]
    fn test_allocate_records_entry() {
        let mut cache = test_cache();
        assert!(cache.allocate_for("req-0", 6));

        let entry = cache.entry("req-0").unwrap();
        assert_eq!(entry.tokens_used, 6);
        assert_eq!(entry.handle.num_blocks, 2);
        assert_eq!(entry.max_allowed, 8);
        assert_eq!(cache.used_tokens("req-0"), Some(6));
    }

    #[test]
    fn test_duplicate_allocation_rejected() {
        let mut cache = test_cache();
        assert!(cache.allocate_for("req-0", 4));
        assert!(!cache.allocate_for("req-0", 4));
        assert_eq!(cache.allocator().used_blocks(), 1);
    }

    #[test]
    fn test_append_respects_capacity() {
        let mut cache = test_cache();
        assert!(cache.allocate_for("req-0", 6)); // 2 blocks, max 8

        assert!(cache.append_token("req-0"));
        assert!(cache.append_token("req-0"));
        assert_eq!(cache.used_tokens("req-0"), Some(8));

        // At capacity now.
        assert!(!cache.append_token("req-0"));
        assert_eq!(cache.used_tokens("req-0"), Some(8));
    }

    #[test]
    fn test_zero_token_allocation() {
        let mut cache = test_cache();
        assert!(cache.allocate_for("req-0", 0));

        let entry = cache.entry("req-0").unwrap();
        assert_eq!(entry.max_allowed, 0);
        assert!(!cache.append_token("req-0"));
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut cache = test_cache();
        assert!(cache.allocate_for("req-0", 4));
        assert_eq!(cache.allocator().used_blocks(), 1);

        cache.free_for("req-0");
        assert_eq!(cache.allocator().used_blocks(), 0);
        assert!(cache.entry("req-0").is_none());

        // Second free and unknown ids are no-ops.
        cache.free_for("req-0");
        cache.free_for("never-seen");
        assert_eq!(cache.allocator().used_blocks(), 0);
    }

    #[test]
    fn test_view_shape_and_offset() {
        let mut cache = test_cache();
        assert!(cache.allocate_for("a", 4)); // block 0
        assert!(cache.allocate_for("b", 5)); // blocks 1-2

        let view = cache.k_view("b", 1).unwrap();
        assert_eq!(view.shape(), [2, 5, 4]);
        // 2 blocks * 2 heads * 4 slots * 4 dims.
        assert_eq!(view.data().len(), 64);

        // Offset: layer 1 of 8 blocks, then skip block 0.
        let block_elems = 2 * 4 * 4;
        let layer_elems = 8 * block_elems;
        let expected_offset = layer_elems + block_elems;
        let base = cache.k_view("b", 0).unwrap().data().as_ptr() as usize;
        let arena_base = cache.k_view("a", 0).unwrap().data().as_ptr() as usize;
        assert_eq!(
            base - arena_base,
            block_elems * std::mem::size_of::<f32>()
        );
        let layer1 = cache.k_view("b", 1).unwrap().data().as_ptr() as usize;
        assert_eq!(
            layer1 - arena_base,
            expected_offset * std::mem::size_of::<f32>()
        );

        assert!(cache.k_view("b", 2).is_none());
        assert!(cache.v_view("missing", 0).is_none());
    }

    #[test]
    fn test_token_offset_in_block() {
        let mut cache = test_cache();
        assert!(cache.allocate_for("req-0", 5));
        assert_eq!(cache.token_offset_in_block("req-0"), Some(1));
        assert!(cache.append_token("req-0"));
        assert_eq!(cache.token_offset_in_block("req-0"), Some(2));
        assert_eq!(cache.token_offset_in_block("missing"), None);
    }

    #[test]
    fn test_byte_accounting() {
        let mut cache = test_cache();
        let bytes_per_block = 2 * 2 * 2 * 4 * 4 * 4; // 2 arenas * L * H * S * D * f32
        assert_eq!(cache.total_free_bytes(), 8 * bytes_per_block);
        assert_eq!(cache.total_allocated_bytes(), 0);

        assert!(cache.allocate_for("req-0", 8)); // 2 blocks
        assert_eq!(cache.total_allocated_bytes(), 2 * bytes_per_block);
        assert_eq!(cache.total_free_bytes(), 6 * bytes_per_block);
        assert!(!cache.is_full());
    }

    #[test]
    fn test_dump_cache_stats() {
        let mut cache = test_cache();
        assert!(cache.allocate_for("req-0", 5));

        let mut out = Vec::new();
        cache.dump_cache_stats(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("total_blocks=8"));
        assert!(text.contains("id=req-0 tokens_used=5 max_allowed=8"));
    }
}
