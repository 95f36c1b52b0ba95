//! Lifecycle reporting for transfers in flight.
use std::sync::Arc;

/// A trait which callers can implement to observe a transfer as it runs.
///
/// All methods have empty default implementations so an observer only needs
/// to override the events it cares about.  `completed_bytes` is monotonically
/// non-decreasing within one run, and for checkpointed transfers a
/// [`transfer_data`](Self::transfer_data) call is only made after the part it
/// reports has been durably recorded, so observers may treat reported bytes
/// as work that will survive a crash.
#[allow(unused_variables)]
pub trait ProgressListener: Send + Sync {
    /// The transfer is about to start moving parts.  On a resumed run
    /// `completed_bytes` reflects the work already recorded in the
    /// checkpoint.
    fn transfer_started(&self, completed_bytes: u64, total_bytes: u64) {}

    /// Another part has finished and been recorded.
    fn transfer_data(&self, completed_bytes: u64, total_bytes: u64) {}

    /// The transfer committed successfully; `completed_bytes` equals
    /// `total_bytes`.
    fn transfer_completed(&self, completed_bytes: u64, total_bytes: u64) {}

    /// The transfer hit a terminal error.
    fn transfer_failed(&self, completed_bytes: u64, total_bytes: u64) {}
}

/// Listener used when the caller does not care about progress.
pub(crate) struct NoProgress;

impl ProgressListener for NoProgress {}

/// The coordinator-side tally behind the listener events.
///
/// Only the coordinator task touches this, so the running byte count needs no
/// synchronization and stays monotonic by construction.
pub(crate) struct ProgressTally {
    listener: Arc<dyn ProgressListener>,
    completed_bytes: u64,
    total_bytes: u64,
}

impl ProgressTally {
    pub(crate) fn new(
        listener: Arc<dyn ProgressListener>,
        completed_bytes: u64,
        total_bytes: u64,
    ) -> Self {
        Self {
            listener,
            completed_bytes,
            total_bytes,
        }
    }

    pub(crate) fn started(&self) {
        self.listener
            .transfer_started(self.completed_bytes, self.total_bytes);
    }

    pub(crate) fn data(&mut self, bytes: u64) {
        self.completed_bytes += bytes;
        self.listener
            .transfer_data(self.completed_bytes, self.total_bytes);
    }

    pub(crate) fn completed(&self) {
        self.listener
            .transfer_completed(self.total_bytes, self.total_bytes);
    }

    pub(crate) fn failed(&self) {
        self.listener
            .transfer_failed(self.completed_bytes, self.total_bytes);
    }
}
