//! Progress reporting for long-running passes.
//!
//! [`ProgressCallback`] keeps the pipeline independent of how progress is
//! shown. The CLI plugs in `indicatif` bars; library callers and tests use
//! [`NullProgress`].

use std::sync::Arc;

/// Receives progress updates from a running pass.
///
/// Implementations must be `Send + Sync`: row handlers report from spawned
/// tokio tasks through a shared `Arc`.
pub trait ProgressCallback: Send + Sync {
    /// Sets the total expected units of work.
    fn set_total(&self, total: u64);

    /// Sets the absolute position.
    fn set_position(&self, pos: u64);

    /// Advances by `delta` units.
    fn inc(&self, delta: u64);

    /// Replaces the message shown next to the indicator.
    fn set_message(&self, msg: String);

    /// Marks the work as complete with a final message.
    fn finish(&self, msg: String);

    /// Marks the work as complete and removes the indicator.
    fn finish_and_clear(&self);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn set_position(&self, _pos: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
    fn finish_and_clear(&self) {}
}

/// Shared [`NullProgress`] handle.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
