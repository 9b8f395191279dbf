#![forbid(unsafe_code)]

//! Deferred destructor pool.
//!
//! Freeing a composite value with many elements on the control thread would
//! stall every connection for the duration of the teardown, so large values
//! are detached from the key space and handed to a small set of background
//! workers that drop them off-thread. Ownership transfers fully at
//! submission; the control thread never touches a submitted value again.
//!
//! This is the only place in the system where true parallelism exists, so
//! the queue hand-off is the only synchronization point: a bounded channel
//! with a mutex-shared receiver.

use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

const QUEUE_DEPTH: usize = 1024;

#[derive(Debug)]
pub struct DropPool {
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl DropPool {
    /// Spawn `workers` background threads blocking on the job queue.
    /// At least one worker is always started.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = sync_channel::<Job>(QUEUE_DEPTH);
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..workers.max(1))
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("lazyfree-{i}"))
                    .spawn(move || worker_loop(&receiver))
                    .unwrap_or_else(|err| panic!("failed to spawn lazyfree worker: {err}"))
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queue a destruction job. When the queue is full (or the workers are
    /// gone) the job is handed back so the caller can run it inline instead.
    pub fn try_submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), Job> {
        let Some(sender) = &self.sender else {
            return Err(Box::new(job));
        };
        sender.try_send(Box::new(job)).map_err(|err| match err {
            TrySendError::Full(job) | TrySendError::Disconnected(job) => job,
        })
    }
}

impl Drop for DropPool {
    fn drop(&mut self) {
        // Disconnect the queue so workers drain what is pending and exit.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let Ok(guard) = receiver.lock() else {
                return;
            };
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DropPool;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn submitted_jobs_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = DropPool::new(2);
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.try_submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap_or_else(|job| job());
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn drop_joins_and_drains_pending_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = DropPool::new(1);
            for _ in 0..16 {
                let counter = Arc::clone(&counter);
                pool.try_submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap_or_else(|job| job());
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn values_moved_into_jobs_are_dropped() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let pool = DropPool::new(2);
        for _ in 0..8 {
            let tracked = Tracked(Arc::clone(&drops));
            pool.try_submit(move || drop(tracked))
                .unwrap_or_else(|job| job());
        }
        drop(pool);
        assert_eq!(drops.load(Ordering::SeqCst), 8);
    }
}
