//! Fixed-size pool of worker threads fed from a blocking queue.
//!
//! The reactor stays on its own thread; anything that may block — socket
//! drains, parsing, response building, database checkout — runs here. Tasks
//! submitted for one connection are serialized by the reactor itself, which
//! only re-arms a connection's interest once the previous task has completed,
//! so workers never need to coordinate among themselves.

pub mod queue;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use log::warn;

use crate::workers::queue::BlockingQueue;

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

/// Handle to a submitted task. Dropping it detaches the task; waiting on it
/// blocks until the worker has run the closure.
#[derive(Debug)]
pub struct TaskHandle<R> {
    done: Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task finishes. `None` when the pool shut down before
    /// the task ran.
    pub fn wait(self) -> Option<R> {
        self.done.recv().ok()
    }

    /// Non-blocking probe for the result.
    pub fn try_wait(&self) -> Option<R> {
        match self.done.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

pub struct WorkerPool {
    jobs: Arc<BlockingQueue<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Pool sized at twice the available parallelism.
    pub fn new() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(8);
        Self::with_workers(workers)
    }

    pub fn with_workers(workers: usize) -> Self {
        assert!(workers > 0);
        let jobs = Arc::new(BlockingQueue::unbounded());
        let threads = (0..workers)
            .map(|i| {
                let jobs = Arc::clone(&jobs);
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(&jobs))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { jobs, threads }
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    /// Queues `task` and returns a handle carrying its result. The send side
    /// of the completion channel is owned by the task, so a caller that does
    /// not care can simply drop the handle.
    pub fn submit<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.jobs.push(Job::Run(Box::new(move || {
            let _ = tx.send(task());
        })));
        TaskHandle { done: rx }
    }

    /// Cooperative shutdown: one sentinel per worker, then join. Tasks queued
    /// before the sentinels still run.
    pub fn shutdown(&mut self) {
        for _ in 0..self.threads.len() {
            self.jobs.push(Job::Shutdown);
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked before shutdown");
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown();
        }
    }
}

fn worker_loop(jobs: &BlockingQueue<Job>) {
    loop {
        match jobs.pop() {
            Job::Run(task) => task(),
            Job::Shutdown => break,
        }
    }
}
