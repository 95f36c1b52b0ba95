//! The fixed-size worker pool that moves parts concurrently.
//!
//! The shape is a bounded job queue filled up-front and then closed, a
//! results channel wide enough that no worker ever blocks on it, a
//! single-slot failure channel, and a cancellation signal.  Workers drain the
//! queue until it is empty or cancellation is observed; the first failure
//! wins and every later one is dropped.  Cancellation is cooperative: a
//! worker checks the signal before dispatching the next part and again after
//! the current transfer returns, so an in-flight request is never torn down
//! mid-call, its result is simply discarded.
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

/// The most workers a caller can request; anything above is clamped.
pub(crate) const MAX_ROUTINES: usize = 100;

/// One mode's part-transfer operation, shared by every worker in the pool.
#[async_trait]
pub(crate) trait PartWorker: Send + Sync + 'static {
    type Job: Send + 'static;
    type Output: Send + 'static;

    async fn transfer(&self, job: Self::Job) -> Result<Self::Output>;
}

/// A running pool.  The coordinator that started it pulls completed parts out
/// with [`next_success`](Self::next_success) until it has seen one per
/// scheduled job, or until the first failure.
pub(crate) struct WorkerPool<T> {
    results: mpsc::Receiver<T>,
    failures: mpsc::Receiver<TransferError>,
    cancel: watch::Sender<bool>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Enqueue `jobs` in order, close the queue, and start
    /// `routines.clamp(1, 100)` workers draining it.
    pub(crate) fn start<W>(worker: Arc<W>, jobs: Vec<W::Job>, routines: usize) -> Self
    where
        W: PartWorker<Output = T>,
    {
        let capacity = jobs.len().max(1);

        let (job_sender, job_receiver) = mpsc::channel(capacity);
        for job in jobs {
            job_sender
                .try_send(job)
                .unwrap_or_else(|_| panic!("BUG: job queue is sized to hold every job"));
        }
        // Dropping the sender closes the queue; a worker seeing `None` knows
        // the plan is fully dispatched.
        drop(job_sender);

        let job_receiver = Arc::new(Mutex::new(job_receiver));
        let (result_sender, results) = mpsc::channel(capacity);
        let (failure_sender, failures) = mpsc::channel(1);
        let (cancel, cancelled) = watch::channel(false);

        let routines = routines.clamp(1, MAX_ROUTINES);
        debug!(routines, jobs = capacity, "starting worker pool");

        for id in 0..routines {
            let worker = worker.clone();
            let jobs = job_receiver.clone();
            let results = result_sender.clone();
            let failures = failure_sender.clone();
            let cancelled = cancelled.clone();

            tokio::spawn(async move {
                loop {
                    if *cancelled.borrow() {
                        break;
                    }

                    let job = {
                        let mut queue = jobs.lock().await;
                        queue.recv().await
                    };
                    let Some(job) = job else {
                        // Queue drained; normal exit.
                        break;
                    };

                    match worker.transfer(job).await {
                        Ok(output) => {
                            if *cancelled.borrow() {
                                debug!(worker = id, "discarding part finished after cancellation");
                                break;
                            }

                            if results.send(output).await.is_err() {
                                // The coordinator has gone away; nobody wants
                                // this result.
                                break;
                            }
                        }
                        Err(error) => {
                            // Only the first failure fits in the channel;
                            // the rest are dropped here.
                            let _ = failures.try_send(error);
                            break;
                        }
                    }
                }
            });
        }

        Self {
            results,
            failures,
            cancel,
        }
    }

    /// Wait for the next successfully transferred part.
    ///
    /// On the first failure this signals cancellation to the remaining
    /// workers and returns the error without waiting for them; each finishes
    /// the part it has in flight and exits.
    pub(crate) async fn next_success(&mut self) -> Result<T> {
        tokio::select! {
            Some(output) = self.results.recv() => Ok(output),
            Some(error) = self.failures.recv() => {
                self.cancel();
                Err(error)
            }
            else => panic!("BUG: workers exited without delivering a result or a failure"),
        }
    }

    /// Tell the workers to stop picking up new parts.
    pub(crate) fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}
