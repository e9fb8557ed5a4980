//! Fixed-size worker pool for decode/transform/encode work.
//!
//! Jobs are queued on an unbounded crossbeam channel and picked up by the
//! first idle worker. The pool never resizes. Shutdown is split in two so
//! that the last connection to close can retire the pool from inside a
//! worker without joining itself: [`WorkerPool::shutdown`] only signals,
//! [`WorkerPool::join`] waits.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Terminate,
}

/// Returned when a job is submitted after shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolClosed;

pub struct WorkerPool {
    sender: Sender<Message>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = unbounded();
        let mut handles = Vec::with_capacity(size);

        for worker_id in 0..size {
            let receiver: Receiver<Message> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver))?;
            handles.push(handle);
        }

        Ok(Self {
            sender,
            handles: Mutex::new(handles),
            closed: AtomicBool::new(false),
            size,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Jobs queued before shutdown still run.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(PoolClosed);
        }
        self.sender
            .send(Message::Run(Box::new(job)))
            .map_err(|_| PoolClosed)
    }

    /// Stop accepting jobs and tell every worker to exit once the queue drains.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.size {
            let _ = self.sender.send(Message::Terminate);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for all workers to exit. Must not be called from a worker.
    pub fn join(&self) {
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Message>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(job) => job(),
            Message::Terminate => break,
        }
    }
    debug!(worker = worker_id, "Worker exiting");
}
