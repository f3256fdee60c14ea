//! Per-thread state threaded explicitly through the hot path.
//!
//! Hosts with cooperative schedulers keep one `ThreadContext` per task and
//! pass it to [`crate::Recorder::record`]. Hosts that are happy with plain
//! thread-local storage can use [`with_thread_context`] instead.

use std::cell::RefCell;

/// Re-entrancy flag and count-sampler state for one thread of execution.
#[derive(Debug, Default)]
pub struct ThreadContext {
    pub(crate) recording: bool,
    pub(crate) sample_count: u64,
    /// `None` until this thread first becomes eligible for sampling.
    pub(crate) sample_rate: Option<u64>,
}

impl ThreadContext {
    pub const fn new() -> Self {
        Self {
            recording: false,
            sample_count: 0,
            sample_rate: None,
        }
    }

    /// True while this context is inside the recording path.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Enter the recording path. Returns `None` if already inside it.
    pub(crate) fn enter(&mut self) -> Option<RecordingGuard<'_>> {
        if self.recording {
            return None;
        }
        self.recording = true;
        Some(RecordingGuard { cx: self })
    }
}

/// Clears the re-entrancy flag on drop, including on unwind.
pub(crate) struct RecordingGuard<'a> {
    cx: &'a mut ThreadContext,
}

impl RecordingGuard<'_> {
    pub(crate) fn context(&mut self) -> &mut ThreadContext {
        self.cx
    }
}

impl Drop for RecordingGuard<'_> {
    fn drop(&mut self) {
        self.cx.recording = false;
    }
}

thread_local! {
    static THREAD_CONTEXT: RefCell<ThreadContext> = const { RefCell::new(ThreadContext::new()) };
}

/// Run `f` with the calling thread's implicit context.
///
/// Returns `None` when the context is already borrowed further up the
/// stack, which only happens when recording re-enters itself.
pub fn with_thread_context<R>(f: impl FnOnce(&mut ThreadContext) -> R) -> Option<R> {
    THREAD_CONTEXT
        .try_with(|cell| cell.try_borrow_mut().ok().map(|mut cx| f(&mut cx)))
        .ok()
        .flatten()
}
