//! Audio-thread marshaller.
//!
//! Public API calls from any thread are boxed into jobs and pushed onto a
//! multi-producer single-consumer FIFO; the tick drains the queue on the
//! audio thread at its start and end. Jobs from one sender run in enqueue
//! order. A job posted while a drain is running (reentrantly, from a job
//! body) is only picked up by the next drain: each drain is bounded by the
//! queue length observed when it starts.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::engine::EngineCore;
use crate::error::{Result, SonaraError};

pub(crate) type Job = Box<dyn FnOnce(&mut EngineCore) -> Result<()> + Send + 'static>;

/// Completion handle for the request/reply submission form.
///
/// The job's result (or failure) is delivered once the action has been fully
/// processed by a tick drain.
pub struct Ticket<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    /// Block until the action has run. Returns [`SonaraError::Disposed`] if
    /// the engine went away before processing it.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(SonaraError::Disposed))
    }

    /// Non-blocking poll; `None` while the action is still pending.
    pub fn try_wait(&self) -> Option<Result<T>> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
pub(crate) struct JobSender {
    tx: Sender<Job>,
}

impl JobSender {
    /// Fire-and-forget submission. Errors raised by the job are logged by
    /// the drain; submission to a disposed engine is silently dropped.
    pub fn post(&self, job: impl FnOnce(&mut EngineCore) -> Result<()> + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            log::debug!("deferred action dropped: engine disposed");
        }
    }

    /// Request/reply submission; the caller can suspend on the returned
    /// [`Ticket`] until the next tick has processed the action.
    pub fn request<T, F>(&self, job: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineCore) -> Result<T> + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        self.post(move |core| {
            let _ = done_tx.send(job(core));
            Ok(())
        });
        Ticket { rx: done_rx }
    }
}

pub(crate) struct JobQueue {
    rx: Receiver<Job>,
}

impl JobQueue {
    pub fn channel() -> (JobSender, JobQueue) {
        let (tx, rx) = unbounded();
        (JobSender { tx }, JobQueue { rx })
    }

    /// Drain every job that was pending when the drain began, in FIFO order.
    pub fn drain(&self, core: &mut EngineCore) {
        let pending = self.rx.len();
        for _ in 0..pending {
            match self.rx.try_recv() {
                Ok(job) => {
                    if let Err(e) = job(core) {
                        log::warn!("deferred audio action failed: {}", e);
                    }
                }
                Err(_) => break,
            }
        }
    }
}
