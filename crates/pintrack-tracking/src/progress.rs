//! Progress reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives progress notifications from tracking sessions and solves.
///
/// Every method has a no-op default so sinks only implement what they show.
pub trait ProgressSink: Send + Sync {
    /// Work begins; `total` is the number of units (markers or keyframes).
    fn start(&self, _total: usize) {}

    /// Overall completion in `[0, 1]`.
    fn update(&self, _fraction: f64) {}

    fn end(&self) {}

    /// A user-facing diagnostic, e.g. a marker that failed to track.
    fn report_error(&self, _message: &str) {}
}

/// Sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

/// Shared cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_null_progress_accepts_calls() {
        let sink: &dyn ProgressSink = &NullProgress;
        sink.start(3);
        sink.update(0.5);
        sink.report_error("ignored");
        sink.end();
    }
}
