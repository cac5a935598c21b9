//! Concurrency limiter for outbound get requests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Job = Box<dyn FnOnce() + Send>;

struct Inner {
    limit: usize,
    running: usize,
    queue: VecDeque<Job>,
}

/// Admits up to `limit` callbacks at a time; further callbacks wait in FIFO
/// order until a running one calls [`done`](Throttle::done).
///
/// Callbacks run on the caller of `add` or `done` and are expected to only
/// dispatch their actual work.
#[derive(Clone)]
pub struct Throttle {
    inner: Arc<Mutex<Inner>>,
}

impl Throttle {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                limit,
                running: 0,
                queue: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the callback now if a slot is free, otherwise queue it.
    pub fn add<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.lock();
            if inner.running >= inner.limit {
                inner.queue.push_back(Box::new(cb));
                return;
            }
            inner.running += 1;
        }
        cb();
    }

    /// Release a slot, handing it to the next queued callback if any.
    ///
    /// # Panics
    ///
    /// Panics if no callback is running.
    pub fn done(&self) {
        let next = {
            let mut inner = self.lock();
            assert!(inner.running > 0, "throttle: negative running counter");
            match inner.queue.pop_front() {
                Some(cb) => cb,
                None => {
                    inner.running -= 1;
                    return;
                }
            }
        };
        next();
    }

    /// Number of callbacks currently holding a slot.
    pub fn running(&self) -> usize {
        self.lock().running
    }
}
