// src/handle/query.rs

//! Object type introspection and the bounded pool that runs it.
//!
//! Resolving an unknown object type means duplicating the handle out of the
//! owning process and asking the object manager for its type. Both calls are
//! synchronous and can be slow, so the chain never issues them inline:
//! [`QueryPool`] hands each query to a fixed set of worker threads and waits
//! at most `timeout` for the answer. A full queue or a late answer fails the
//! one event that asked; the stream keeps moving.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use super::HandleError;

/// Resolves the object type name behind a handle owned by another process.
///
/// Implementations must close every handle they duplicate, whether or not
/// the query succeeds.
pub trait HandleIntrospector: Send + Sync {
    fn query_type(&self, pid: u32, handle: u32) -> Result<String, HandleError>;
}

struct Job {
    pid: u32,
    handle: u32,
    reply: Sender<Result<String, HandleError>>,
}

/// Fixed-size worker pool in front of a [`HandleIntrospector`].
pub struct QueryPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl QueryPool {
    /// Spawns `workers` threads (at least one) sharing a job queue of
    /// `queue_depth` slots.
    pub fn new(
        introspector: Arc<dyn HandleIntrospector>,
        workers: usize,
        queue_depth: usize,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = channel::bounded::<Job>(queue_depth.max(1));

        let workers = (0..workers.max(1))
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                let introspector = Arc::clone(&introspector);
                thread::Builder::new()
                    .name(format!("handle-query-{i}"))
                    .spawn(move || {
                        // Each worker loops until the pool is dropped and the queue drained.
                        while let Ok(job) = rx.recv() {
                            let res = introspector.query_type(job.pid, job.handle);
                            // The requester may have timed out already.
                            let _ = job.reply.send(res);
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("failed to spawn handle query worker: {e}");
                    None
                }
            })
            .collect::<Vec<_>>();

        log::debug!("handle query pool started with {} worker(s)", workers.len());
        Self {
            tx: Some(tx),
            workers,
            timeout,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Closes the queue and waits for in-flight queries to finish.
    pub fn shutdown(mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl HandleIntrospector for QueryPool {
    fn query_type(&self, pid: u32, handle: u32) -> Result<String, HandleError> {
        let tx = self.tx.as_ref().ok_or(HandleError::Closed)?;
        let (reply, answer) = channel::bounded(1);

        match tx.try_send(Job { pid, handle, reply }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(HandleError::Busy),
            Err(TrySendError::Disconnected(_)) => return Err(HandleError::Closed),
        }

        match answer.recv_timeout(self.timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => Err(HandleError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(HandleError::Closed),
        }
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        // Workers exit on their own once the queue disconnects; a worker stuck
        // in a slow syscall must not block the drop.
        self.tx.take();
    }
}
