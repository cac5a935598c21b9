//! Time-ordered eviction queue with a fixed delay.
//!
//! Every key added to the queue expires `delay` after it was added. Since the
//! delay is the same for all entries, insertion order equals expiry order, so
//! a single background task sleeping until the front entry's deadline is
//! enough to serve any number of keys.
//!
//! ```text
//! add(k1) add(k2)        remove(k2)
//!    │       │               │
//!    ▼       ▼               ▼
//! [k1 @t1, k2 @t2]  →  [k1 @t1]  →  (t1 elapses)  →  on_expire(k1)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

struct Entries<K> {
    seq: u64,
    order: BTreeMap<u64, (K, Instant)>,
    index: HashMap<K, u64>,
}

struct Shared<K> {
    entries: Mutex<Entries<K>>,
    notify: Notify,
    delay: Duration,
}

impl<K> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, Entries<K>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO queue of keys that expire after a fixed delay.
///
/// The expiry callback runs on the queue's background task and must not block.
/// Dropping the queue stops the task without firing pending entries.
pub struct TimerQueue<K> {
    shared: Arc<Shared<K>>,
    worker: JoinHandle<()>,
}

impl<K> TimerQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create a queue and spawn its expiry task on the current tokio runtime.
    pub fn new<F>(delay: Duration, on_expire: F) -> Self
    where
        F: Fn(K) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            entries: Mutex::new(Entries {
                seq: 0,
                order: BTreeMap::new(),
                index: HashMap::new(),
            }),
            notify: Notify::new(),
            delay,
        });
        let worker = tokio::spawn(run(shared.clone(), on_expire));
        Self { shared, worker }
    }

    /// The delay applied to every added key.
    pub fn delay(&self) -> Duration {
        self.shared.delay
    }

    /// Add a key to the back of the queue.
    ///
    /// A key already in the queue is moved to the back with a fresh deadline.
    pub fn add(&self, key: K) {
        let deadline = Instant::now() + self.shared.delay;
        let was_empty = {
            let mut entries = self.shared.lock();
            if let Some(seq) = entries.index.remove(&key) {
                entries.order.remove(&seq);
            }
            let was_empty = entries.order.is_empty();
            entries.seq += 1;
            let seq = entries.seq;
            entries.order.insert(seq, (key.clone(), deadline));
            entries.index.insert(key, seq);
            was_empty
        };
        if was_empty {
            self.shared.notify.notify_one();
        }
    }

    /// Remove a key. Returns false if the key was not queued, either because
    /// it was never added or because it already expired.
    pub fn remove(&self, key: &K) -> bool {
        let mut entries = self.shared.lock();
        match entries.index.remove(key) {
            Some(seq) => {
                entries.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    /// Check whether a key is currently queued.
    pub fn contains(&self, key: &K) -> bool {
        self.shared.lock().index.contains_key(key)
    }

    /// Drop all queued keys without firing them.
    pub fn clear(&self) {
        let mut entries = self.shared.lock();
        entries.order.clear();
        entries.index.clear();
    }

    /// Number of queued keys.
    pub fn len(&self) -> usize {
        self.shared.lock().order.len()
    }

    /// Check whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Drop for TimerQueue<K> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run<K, F>(shared: Arc<Shared<K>>, on_expire: F)
where
    K: Eq + Hash + Clone + Send + 'static,
    F: Fn(K) + Send + Sync + 'static,
{
    loop {
        let next = shared.lock().order.values().next().map(|(_, at)| *at);

        let Some(deadline) = next else {
            shared.notify.notified().await;
            continue;
        };

        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = shared.notify.notified() => continue,
        }

        let now = Instant::now();
        let expired = {
            let mut entries = shared.lock();
            let mut expired = Vec::new();
            while let Some((&seq, (_, at))) = entries.order.iter().next() {
                if *at > now {
                    break;
                }
                if let Some((key, _)) = entries.order.remove(&seq) {
                    entries.index.remove(&key);
                    expired.push(key);
                }
            }
            expired
        };

        trace!("Timer queue expired {} entries", expired.len());
        for key in expired {
            on_expire(key);
        }
    }
}
