use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Receives progress from long-running pack operations and lets the caller
/// request cancellation.
pub trait ProgressMonitor: Send + Sync {
    /// A new phase with `total` units of work, or `None` if unknown.
    fn begin_task(&self, _title: &str, _total: Option<u64>) {}

    fn update(&self, _completed: u64) {}

    fn end_task(&self) {}

    /// Polled between units of work; returning `true` aborts with
    /// [`PackError::Cancelled`](crate::PackError::Cancelled).
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Ignores progress and never cancels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgress;

impl ProgressMonitor for NullProgress {}

/// Emits each phase as a `tracing` event and cancels once the shared flag
/// is raised.
#[derive(Clone, Debug, Default)]
pub struct TracingProgress {
    cancelled: Arc<AtomicBool>,
}

impl TracingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that cancels this monitor from another thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl ProgressMonitor for TracingProgress {
    fn begin_task(&self, title: &str, total: Option<u64>) {
        debug!(task = title, ?total, "begin");
    }

    fn end_task(&self) {
        debug!("end task");
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Return `Cancelled` if the monitor asked to stop.
pub(crate) fn check_cancelled(progress: &dyn ProgressMonitor) -> crate::PackResult<()> {
    if progress.is_cancelled() {
        Err(crate::PackError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_progress_never_cancels() {
        assert!(check_cancelled(&NullProgress).is_ok());
    }

    #[test]
    fn tracing_progress_cancels_through_handle() {
        let progress = TracingProgress::new();
        assert!(check_cancelled(&progress).is_ok());
        progress.cancel_handle().store(true, Ordering::Release);
        assert!(matches!(
            check_cancelled(&progress),
            Err(crate::PackError::Cancelled)
        ));
    }
}
