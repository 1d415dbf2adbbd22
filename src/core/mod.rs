//! Core data structures: requests, batches, block allocation, and the
//! paged KV cache.

pub mod allocator;
pub mod batch;
pub mod block;
pub mod kv_cache;
pub mod request;
pub mod tensor;

pub use allocator::BlockAllocator;
pub use batch::Batch;
pub use block::{blocks_for_tokens, KvHandle};
pub use kv_cache::{KvCache, KvView, SequenceKvEntry};
pub use request::{FinishReason, Request, RequestState, TokenCallback};
pub use tensor::{DType, Logits};
