//! Request lifecycle.
//!
//! A request is the unit of generation work: an immutable prompt plus
//! mutable execution state the engine drives through the
//! Pending -> Prefilling -> Decoding -> Finished/Failed lifecycle.
//!
//! Requests are shared as `Arc<Request>` between the submitting thread and
//! the engine. The immutable inputs are plain fields; the execution state
//! sits behind a mutex so the submitter can observe progress, and the
//! cancellation flag is the one atomic visible from any thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::SamplingParams;

/// Callback invoked for each emitted token and once on the terminal
/// transition (with `finished = true`). Must not block.
pub type TokenCallback = Box<dyn Fn(u32, bool) + Send + Sync>;

/// Lifecycle state of a request.
///
/// States only move forward; `Finished` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Submitted, not yet admitted by the scheduler.
    Pending,
    /// Admitted; prompt is being prefilled.
    Prefilling,
    /// Prefill complete; generating tokens.
    Decoding,
    /// Generation complete.
    Finished,
    /// Terminated by an error.
    Failed,
}

impl RequestState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Get the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Prefilling => "Prefilling",
            Self::Decoding => "Decoding",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
        }
    }
}

/// Reason a request reached `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A configured stop token was generated.
    StopToken,
    /// The configured stop string appeared in the decoded text.
    StopString,
    /// The end-of-sequence token was generated.
    EndOfSequence,
    /// The per-request generation cap was reached.
    MaxTokens,
    /// Cancelled cooperatively by the submitter.
    Cancelled,
    /// The sequence's KV region ran out of room.
    Capacity,
}

/// Mutable execution state, engine-owned after submission.
#[derive(Debug)]
struct ExecState {
    state: RequestState,
    generated_tokens: Vec<u32>,
    finish_reason: Option<FinishReason>,
    error_message: Option<String>,
}

/// A single inference request.
///
/// Construct with [`Request::new`] and the builder setters, then hand it to
/// [`Scheduler::submit`](crate::scheduler::Scheduler::submit), which wraps
/// it in an `Arc` and returns the shared handle.
pub struct Request {
    id: String,
    prompt_tokens: Vec<u32>,
    prompt_text: Option<String>,
    max_tokens: usize,
    sampling: SamplingParams,
    stop_tokens: Vec<u32>,
    stop_string: Option<String>,
    streaming: bool,
    arrival_time_ns: u64,
    cancelled: AtomicBool,
    exec: Mutex<ExecState>,
    token_callback: Option<TokenCallback>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("prompt_len", &self.prompt_tokens.len())
            .field("max_tokens", &self.max_tokens)
            .field("state", &self.state())
            .finish()
    }
}

impl Request {
    /// Create a request with a pre-tokenized prompt.
    pub fn new(id: impl Into<String>, prompt_tokens: Vec<u32>) -> Self {
        let arrival_time_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            id: id.into(),
            prompt_tokens,
            prompt_text: None,
            max_tokens: 256,
            sampling: SamplingParams::default(),
            stop_tokens: Vec::new(),
            stop_string: None,
            streaming: true,
            arrival_time_ns,
            cancelled: AtomicBool::new(false),
            exec: Mutex::new(ExecState {
                state: RequestState::Pending,
                generated_tokens: Vec::new(),
                finish_reason: None,
                error_message: None,
            }),
            token_callback: None,
        }
    }

    // ========== Builder setters (before submission) ==========

    /// Cap on generated tokens.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sampling configuration; validated at submission.
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Token ids that terminate generation.
    pub fn with_stop_tokens(mut self, stop_tokens: Vec<u32>) -> Self {
        self.stop_tokens = stop_tokens;
        self
    }

    /// Substring of the decoded text that terminates generation. Honored
    /// only when the engine has a tokenizer attached.
    pub fn with_stop_string(mut self, stop_string: impl Into<String>) -> Self {
        self.stop_string = Some(stop_string.into());
        self
    }

    /// Whether per-token callbacks fire (the final callback always does).
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// The original prompt text, when a tokenizer produced the tokens.
    pub fn with_prompt_text(mut self, text: impl Into<String>) -> Self {
        self.prompt_text = Some(text.into());
        self
    }

    /// Install the token callback.
    pub fn with_token_callback(mut self, callback: TokenCallback) -> Self {
        self.token_callback = Some(callback);
        self
    }

    // ========== Immutable inputs ==========

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prompt_tokens(&self) -> &[u32] {
        &self.prompt_tokens
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_tokens.len()
    }

    pub fn prompt_text(&self) -> Option<&str> {
        self.prompt_text.as_deref()
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    pub fn stop_tokens(&self) -> &[u32] {
        &self.stop_tokens
    }

    pub fn stop_string(&self) -> Option<&str> {
        self.stop_string.as_deref()
    }

    pub fn streaming(&self) -> bool {
        self.streaming
    }

    pub fn arrival_time_ns(&self) -> u64 {
        self.arrival_time_ns
    }

    // ========== Cancellation ==========

    /// Request cooperative cancellation. May be called from any thread; the
    /// engine observes the flag before producing the next token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // ========== Execution state ==========

    pub fn state(&self) -> RequestState {
        self.exec.lock().unwrap().state
    }

    /// Advance the lifecycle. Terminal states are sticky: transitions out
    /// of `Finished`/`Failed` are ignored.
    pub(crate) fn set_state(&self, state: RequestState) {
        let mut exec = self.exec.lock().unwrap();
        if exec.state.is_terminal() {
            return;
        }
        exec.state = state;
    }

    /// Snapshot of the generated tokens.
    pub fn generated_tokens(&self) -> Vec<u32> {
        self.exec.lock().unwrap().generated_tokens.clone()
    }

    pub fn generated_len(&self) -> usize {
        self.exec.lock().unwrap().generated_tokens.len()
    }

    /// The most recent token: last generated, or last prompt token before
    /// the first decode step.
    pub fn last_token(&self) -> Option<u32> {
        self.exec
            .lock()
            .unwrap()
            .generated_tokens
            .last()
            .copied()
            .or_else(|| self.prompt_tokens.last().copied())
    }

    /// Append a generated token. Engine-facing: after submission only the
    /// engine thread calls this.
    pub fn append_token(&self, token: u32) {
        let mut exec = self.exec.lock().unwrap();
        debug_assert!(exec.generated_tokens.len() < self.max_tokens);
        exec.generated_tokens.push(token);
    }

    pub fn is_finished(&self) -> bool {
        self.state() == RequestState::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.state() == RequestState::Failed
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.exec.lock().unwrap().finish_reason
    }

    pub fn error_message(&self) -> Option<String> {
        self.exec.lock().unwrap().error_message.clone()
    }

    /// Transition to `Finished` with a reason. No-op once terminal.
    pub(crate) fn mark_finished(&self, reason: FinishReason) {
        let mut exec = self.exec.lock().unwrap();
        if exec.state.is_terminal() {
            return;
        }
        exec.state = RequestState::Finished;
        exec.finish_reason = Some(reason);
    }

    /// Transition to `Failed` with an error message. No-op once terminal.
    pub(crate) fn mark_failed(&self, message: impl Into<String>) {
        let mut exec = self.exec.lock().unwrap();
        if exec.state.is_terminal() {
            return;
        }
        exec.state = RequestState::Failed;
        exec.error_message = Some(message.into());
    }

    /// Invoke the token callback if installed.
    pub(crate) fn notify_token(&self, token: u32, finished: bool) {
        if let Some(callback) = &self.token_callback {
            callback(token, finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_request_creation() {
        let req = Request::new("req-1", vec![10, 20, 30]);

        assert_eq!(req.id(), "req-1");
        assert_eq!(req.prompt_len(), 3);
        assert_eq!(req.generated_len(), 0);
        assert_eq!(req.state(), RequestState::Pending);
        assert!(!req.is_cancelled());
        assert!(req.arrival_time_ns() > 0);
    }

    #[test]
    fn test_builder_setters() {
        let req = Request::new("req-1", vec![1])
            .with_max_tokens(8)
            .with_stop_tokens(vec![99])
            .with_stop_string("done")
            .with_streaming(false)
            .with_prompt_text("hi");

        assert_eq!(req.max_tokens(), 8);
        assert_eq!(req.stop_tokens(), &[99]);
        assert_eq!(req.stop_string(), Some("done"));
        assert!(!req.streaming());
        assert_eq!(req.prompt_text(), Some("hi"));
    }

    #[test]
    fn test_append_and_last_token() {
        let req = Request::new("req-1", vec![1, 2, 3]);
        assert_eq!(req.last_token(), Some(3));

        req.append_token(100);
        req.append_token(101);
        assert_eq!(req.generated_tokens(), vec![100, 101]);
        assert_eq!(req.last_token(), Some(101));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let req = Request::new("req-1", vec![1]);
        req.set_state(RequestState::Prefilling);
        req.set_state(RequestState::Decoding);
        req.mark_finished(FinishReason::MaxTokens);

        assert!(req.is_finished());
        assert_eq!(req.finish_reason(), Some(FinishReason::MaxTokens));

        // No way back out of a terminal state.
        req.set_state(RequestState::Decoding);
        assert!(req.is_finished());
        req.mark_failed("too late");
        assert!(req.is_finished());
        assert!(req.error_message().is_none());
    }

    #[test]
    fn test_failed_records_message() {
        let req = Request::new("req-1", vec![1]);
        req.mark_failed("backend exploded");

        assert!(req.is_failed());
        assert_eq!(req.error_message().as_deref(), Some("backend exploded"));
        assert_eq!(req.finish_reason(), None);
    }

    #[test]
    fn test_cancel_visible_across_threads() {
        let req = Arc::new(Request::new("req-1", vec![1]));
        let other = Arc::clone(&req);
        std::thread::spawn(move || other.cancel()).join().unwrap();
        assert!(req.is_cancelled());
    }

    #[test]
    fn test_callback_invocation() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let req = Request::new("req-1", vec![1]).with_token_callback(Box::new(
            move |_token, finished| {
                seen.fetch_add(if finished { 100 } else { 1 }, Ordering::SeqCst);
            },
        ));

        req.notify_token(5, false);
        req.notify_token(6, false);
        req.notify_token(6, true);
        assert_eq!(count.load(Ordering::SeqCst), 102);
    }
}
