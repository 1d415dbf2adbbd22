//! Request scheduling for continuous batching.
//!
//! The scheduler accepts submissions from any thread, admits requests into
//! the engine's active set up to `max_batch_size`, and assembles
//! single-phase batches each iteration. Admission is FIFO, so no request
//! starves; once admitted, a request runs to completion even as new work
//! arrives.
//!
//! One mutex guards all three queues. The engine thread is the only caller
//! of the dequeue/transition operations; `submit` and request cancellation
//! may race against it freely.
//!
//! ## Example
//!
//! ```
//! use cortexstream::config::SchedulerConfig;
//! use cortexstream::core::request::Request;
//! use cortexstream::scheduler::Scheduler;
//!
//! let scheduler = Scheduler::new(SchedulerConfig { max_batch_size: 4 }).unwrap();
//! scheduler.submit(Request::new("req-0", vec![1, 2, 3])).unwrap();
//!
//! assert!(scheduler.has_work());
//! scheduler.accept_new_requests();
//! let batch = scheduler.build_prefill_batch();
//! assert_eq!(batch.batch_size(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::SchedulerConfig;
use crate::core::batch::Batch;
use crate::core::request::{Request, RequestState};
use crate::error::Result;

#[derive(Default)]
struct SchedulerState {
    /// Submitted, not yet admitted. FIFO.
    pending: VecDeque<Arc<Request>>,
    /// Admitted requests (Prefilling or Decoding), in admission order.
    active: Vec<Arc<Request>>,
    /// Terminal requests awaiting cleanup.
    finished: Vec<Arc<Request>>,
}

/// Thread-safe request scheduler.
pub struct Scheduler {
    max_batch_size: usize,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    /// Create a scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] if `max_batch_size` is zero.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_batch_size: config.max_batch_size,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    /// Submit a request for execution. Callable from any thread; never
    /// blocks on the engine.
    ///
    /// Returns the shared handle the caller can use to observe progress or
    /// cancel.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidSamplingParams`] when the request's
    /// sampling configuration is out of range; the request is not queued.
    pub fn submit(&self, request: Request) -> Result<Arc<Request>> {
        request.sampling().validate()?;
        let request = Arc::new(request);
        let mut state = self.state.lock().unwrap();
        state.pending.push_back(Arc::clone(&request));
        debug!(id = request.id(), pending = state.pending.len(), "request submitted");
        Ok(request)
    }

    /// Whether any request is pending or active.
    pub fn has_work(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.pending.is_empty() || !state.active.is_empty()
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.state.lock().unwrap().pending.is_empty()
    }

    pub fn has_active_requests(&self) -> bool {
        !self.state.lock().unwrap().active.is_empty()
    }

    pub fn num_active_requests(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Drain the pending queue into the active set until it holds
    /// `max_batch_size` requests, transitioning each to `Prefilling`.
    ///
    /// Only the engine thread calls this.
    pub fn accept_new_requests(&self) {
        let mut state = self.state.lock().unwrap();
        while state.active.len() < self.max_batch_size {
            let Some(request) = state.pending.pop_front() else {
                break;
            };
            request.set_state(RequestState::Prefilling);
            debug!(id = request.id(), "request admitted");
            state.active.push(request);
        }
    }

    /// Collect up to `max_batch_size` prefilling requests.
    ///
    /// Ordered ascending by prompt length (stable on insertion order) so
    /// short prompts reach their first token sooner.
    pub fn build_prefill_batch(&self) -> Batch {
        let state = self.state.lock().unwrap();
        let mut members: Vec<&Arc<Request>> = state
            .active
            .iter()
            .filter(|r| r.state() == RequestState::Prefilling)
            .collect();
        members.sort_by_key(|r| r.prompt_len());

        let mut batch = Batch::new(true);
        for request in members.into_iter().take(self.max_batch_size) {
            let len = request.prompt_len();
            batch.push(Arc::clone(request), len);
        }
        batch
    }

    /// Collect up to `max_batch_size` decoding requests.
    ///
    /// Ordered ascending by generated length (stable on insertion order) to
    /// keep latency variance low for fresh requests.
    pub fn build_decode_batch(&self) -> Batch {
        let state = self.state.lock().unwrap();
        let mut members: Vec<&Arc<Request>> = state
            .active
            .iter()
            .filter(|r| r.state() == RequestState::Decoding)
            .collect();
        members.sort_by_key(|r| r.generated_len());

        let mut batch = Batch::new(false);
        for request in members.into_iter().take(self.max_batch_size) {
            let len = request.generated_len() + 1;
            batch.push(Arc::clone(request), len);
        }
        batch
    }

    /// Transition a request from `Prefilling` to `Decoding`. Silently does
    /// nothing when the request is not prefilling.
    pub fn mark_request_ready(&self, request_id: &str) {
        let state = self.state.lock().unwrap();
        if let Some(request) = state.active.iter().find(|r| r.id() == request_id) {
            if request.state() == RequestState::Prefilling {
                request.set_state(RequestState::Decoding);
            }
        }
    }

    /// Move a request from the active set to the finished list.
    pub fn mark_request_finished(&self, request_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.active.iter().position(|r| r.id() == request_id) {
            let request = state.active.remove(pos);
            request.set_state(RequestState::Finished);
            state.finished.push(request);
        }
    }

    /// Remove a request from the active set as failed. The request stays
    /// observable in the finished list until [`Self::remove_finished`].
    pub fn mark_request_failed(&self, request_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.active.iter().position(|r| r.id() == request_id) {
            let request = state.active.remove(pos);
            request.set_state(RequestState::Failed);
            state.finished.push(request);
        }
    }

    /// Look up a request by id, searching active then finished.
    pub fn get_request(&self, request_id: &str) -> Option<Arc<Request>> {
        let state = self.state.lock().unwrap();
        state
            .active
            .iter()
            .chain(state.finished.iter())
            .find(|r| r.id() == request_id)
            .cloned()
    }

    /// The oldest decoding request that has produced at least one token.
    /// Eviction candidate on admission OOM; requests that never decoded a
    /// token are never victims.
    pub(crate) fn oldest_evictable(&self) -> Option<Arc<Request>> {
        let state = self.state.lock().unwrap();
        state
            .active
            .iter()
            .find(|r| r.state() == RequestState::Decoding && r.generated_len() > 0)
            .cloned()
    }

    /// Drop the finished list. Invoked periodically by the engine after
    /// the streaming callbacks have drained.
    pub fn remove_finished(&self) {
        let mut state = self.state.lock().unwrap();
        state.finished.clear();
    }
}
