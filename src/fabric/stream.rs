//! Stream-ordered execution per device.
//!
//! Mirrors the CUDA stream contract the collectives are written against:
//! `enqueue` returns immediately, enqueued work executes in FIFO order on a
//! dedicated worker, and completion is observed through `synchronize`.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::utils::error::{CommError, Result};

enum Job {
    Task(Box<dyn FnOnce() + Send + 'static>),
    Sync(mpsc::Sender<()>),
}

/// An ordered work queue bound to one device.
pub struct Stream {
    device: usize,
    tx: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Create a stream for `device` with its own worker thread.
    pub fn new(device: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(format!("stream-{}", device))
            .spawn(move || {
                for job in rx {
                    match job {
                        Job::Task(task) => task(),
                        Job::Sync(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .expect("failed to spawn stream worker");

        Self {
            device,
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Index of the device this stream is bound to.
    pub fn device(&self) -> usize {
        self.device
    }

    /// Enqueue work; returns as soon as the job is queued.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.tx
            .as_ref()
            .expect("stream sender taken")
            .send(Job::Task(Box::new(task)))
            .map_err(|_| CommError::Launch(format!("stream-{} worker is gone", self.device)))
    }

    /// Block until every previously enqueued job has completed.
    pub fn synchronize(&self) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .as_ref()
            .expect("stream sender taken")
            .send(Job::Sync(done_tx))
            .map_err(|_| CommError::Launch(format!("stream-{} worker is gone", self.device)))?;
        done_rx
            .recv()
            .map_err(|_| CommError::Launch(format!("stream-{} worker died mid-queue", self.device)))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
