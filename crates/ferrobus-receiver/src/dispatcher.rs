//! Job submission to the reactor task.
//!
//! Every mutation of link-owned state crosses this seam: callers hand a
//! closure to the dispatcher and the reactor loop runs it on its own task.
//! A failed submission means the reactor is gone and surfaces as a
//! scheduling error on the caller's promise.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ReceiverError, Result};

/// A unit of work executed on the reactor task against state `S`.
pub(crate) type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Handle for submitting jobs to the reactor loop.
pub(crate) struct Dispatcher<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: 'static> Dispatcher<S> {
    /// Creates a dispatcher and the job stream the reactor loop consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job<S>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Submits a job for execution on the reactor task.
    pub fn dispatch(&self, op: &'static str, job: impl FnOnce(&mut S) + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::new(job))
            .map_err(|_| ReceiverError::Scheduling { op })
    }

    /// Submits a job after `delay`. Submission failures after the delay are
    /// silently dropped: the reactor being gone means nothing is waiting.
    pub fn dispatch_after(
        &self,
        delay: Duration,
        op: &'static str,
        job: impl FnOnce(&mut S) + Send + 'static,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = dispatcher.dispatch(op, job);
        })
    }
}
