//! Bounded pool of reusable worker threads.
//!
//! Workers are stateless request/response units: each job travels with its
//! own reply channel and comes back tagged with the ticket `submit` handed
//! out, so several callers can share one pool without mixing results. A
//! panicking job is reported to its caller as a failure and the worker
//! thread keeps serving.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use tracing::{debug, error};

use crate::error::{EngineError, EngineResult};

/// A job that did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub message: String,
}

impl WorkerFailure {
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker panicked".to_string()
        };
        WorkerFailure { message }
    }
}

/// Reply for the job submitted under `ticket`.
#[derive(Debug)]
pub struct Completion<R> {
    pub ticket: u64,
    pub result: Result<R, WorkerFailure>,
}

struct Envelope<J, R> {
    ticket: u64,
    job: J,
    reply: Sender<Completion<R>>,
}

pub struct WorkerPool<J, R> {
    name: String,
    sender: Option<Sender<Envelope<J, R>>>,
    workers: Vec<JoinHandle<()>>,
    next_ticket: AtomicU64,
}

impl<J: Send + 'static, R: Send + 'static> WorkerPool<J, R> {
    pub fn new<F>(name: &str, size: usize, handler: F) -> EngineResult<Self>
    where
        F: Fn(J) -> R + Send + Sync + 'static,
    {
        let (sender, receiver) = unbounded::<Envelope<J, R>>();
        let handler = Arc::new(handler);
        let mut workers = Vec::with_capacity(size);

        for i in 0..size.max(1) {
            let receiver = receiver.clone();
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    for Envelope { ticket, job, reply } in receiver.iter() {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(job)))
                            .map_err(WorkerFailure::from_panic);
                        if let Err(failure) = &result {
                            error!("worker job {} panicked: {}", ticket, failure.message);
                        }
                        // the caller may have given up waiting
                        let _ = reply.send(Completion { ticket, result });
                    }
                })
                .map_err(|e| EngineError::Worker {
                    message: format!("cannot spawn {} worker: {}", name, e),
                })?;
            workers.push(handle);
        }

        debug!("started {} pool with {} workers", name, workers.len());
        Ok(WorkerPool {
            name: name.to_string(),
            sender: Some(sender),
            workers,
            next_ticket: AtomicU64::new(0),
        })
    }

    /// Queue a job; its completion is sent on `reply` under the returned ticket.
    pub fn submit(&self, job: J, reply: &Sender<Completion<R>>) -> EngineResult<u64> {
        let sender = self.sender.as_ref().ok_or_else(|| EngineError::Worker {
            message: format!("{} pool is shut down", self.name),
        })?;
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        sender
            .send(Envelope {
                ticket,
                job,
                reply: reply.clone(),
            })
            .map_err(|_| EngineError::Worker {
                message: format!("{} pool has no live workers", self.name),
            })?;
        Ok(ticket)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl<J, R> Drop for WorkerPool<J, R> {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_jobs_reply_on_their_own_channel() {
        let pool = WorkerPool::new("square", 2, |n: u64| n * n).unwrap();
        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();

        let a = pool.submit(3, &tx_a).unwrap();
        let b = pool.submit(4, &tx_b).unwrap();
        assert_ne!(a, b);

        let done = rx_a.recv().unwrap();
        assert_eq!((done.ticket, done.result), (a, Ok(9)));
        let done = rx_b.recv().unwrap();
        assert_eq!((done.ticket, done.result), (b, Ok(16)));
    }

    #[test]
    fn test_panic_is_isolated() {
        let pool = WorkerPool::new("fragile", 1, |n: u32| {
            if n == 0 {
                panic!("zero is not allowed");
            }
            100 / n
        })
        .unwrap();
        let (tx, rx) = unbounded();

        pool.submit(0, &tx).unwrap();
        let failure = rx.recv().unwrap().result.unwrap_err();
        assert!(failure.message.contains("zero"));

        // the single worker is still alive
        pool.submit(5, &tx).unwrap();
        assert_eq!(rx.recv().unwrap().result, Ok(20));
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let pool = WorkerPool::new("bounded", 3, move |_: ()| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            a.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();
        let (tx, rx) = unbounded();
        for _ in 0..12 {
            pool.submit((), &tx).unwrap();
        }
        for _ in 0..12 {
            rx.recv().unwrap().result.unwrap();
        }
        assert_eq!(pool.size(), 3);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
