//! Fixed-size worker pool with per-key serialisation.
//!
//! Tasks are submitted with a key. Tasks sharing a key run one at a time, in
//! submission order; tasks with different keys run in parallel on the pool's
//! threads. The reactor keys every task by connection id, which keeps each
//! connection's decode and write work in order without a thread per
//! connection.
//!
//! A key is "active" while it has an entry in the queue map. Submitting to an
//! inactive key creates the entry and hands the key to a worker through the
//! job channel; submitting to an active key only appends. The worker that
//! owns a key runs its tasks until the queue is empty and then retires the
//! key under the same lock, so a key is never owned by two workers.
//!
//! A panicking task is caught on the worker. The pool's failure hook then runs
//! with the task's key, and the key's remaining tasks still run.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Debug,
    hash::Hash,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::ServerError;

/// Unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queued tasks per active key.
type Queues<K> = Arc<Mutex<HashMap<K, VecDeque<Task>>>>;

/// Called with the key of a task that panicked.
pub type FailureHook<K> = Arc<dyn Fn(&K) + Send + Sync + 'static>;

/// Worker pool running at most one task per key at a time.
pub struct KeyedPool<K> {
    queues: Queues<K>,
    jobs: Option<Sender<K>>,
    workers: Vec<JoinHandle<()>>,
}

impl<K> Debug for KeyedPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedPool")
            .field("threads", &self.workers.len())
            .field("accepting", &self.jobs.is_some())
            .finish_non_exhaustive()
    }
}

impl<K> KeyedPool<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Start a pool with `threads` workers (at least one). Panics are logged
    /// and otherwise ignored.
    pub fn new(threads: usize, name: &str) -> Result<Self, ServerError> {
        Self::with_failure_hook(threads, name, |_| {})
    }

    /// Start a pool that calls `on_failure` with the key of every task that
    /// panics.
    pub fn with_failure_hook<F>(threads: usize, name: &str, on_failure: F) -> Result<Self, ServerError>
    where
        F: Fn(&K) + Send + Sync + 'static,
    {
        let on_failure: FailureHook<K> = Arc::new(on_failure);
        let (jobs, rx) = crossbeam_channel::unbounded::<K>();
        let queues: Queues<K> = Arc::new(Mutex::new(HashMap::new()));

        let workers = (0..threads.max(1))
            .map(|index| {
                let rx = rx.clone();
                let queues = Arc::clone(&queues);
                let on_failure = Arc::clone(&on_failure);
                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || worker_loop(&rx, &queues, on_failure.as_ref()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { queues, jobs: Some(jobs), workers })
    }

    /// Queue `task` behind any earlier task with the same key.
    ///
    /// Returns `false` (dropping the task) once the pool is shut down.
    pub fn submit<F>(&self, key: K, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(jobs) = &self.jobs else {
            return false;
        };

        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(&key) {
            queue.push_back(Box::new(task));
            return true;
        }

        queues.insert(key.clone(), VecDeque::from([Box::new(task) as Task]));
        if jobs.send(key.clone()).is_err() {
            queues.remove(&key);
            return false;
        }
        true
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work, let queued tasks finish and join the workers.
    ///
    /// Returns [`ServerError::Shutdown`] if a worker thread died.
    pub fn shutdown(&mut self) -> Result<(), ServerError> {
        drop(self.jobs.take());

        let mut clean = true;
        for worker in self.workers.drain(..) {
            clean &= worker.join().is_ok();
        }

        if clean { Ok(()) } else { Err(ServerError::Shutdown) }
    }
}

impl<K> Drop for KeyedPool<K> {
    fn drop(&mut self) {
        drop(self.jobs.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop<K>(
    rx: &Receiver<K>,
    queues: &Mutex<HashMap<K, VecDeque<Task>>>,
    on_failure: &(dyn Fn(&K) + Send + Sync),
) where
    K: Eq + Hash + Debug,
{
    for key in rx {
        loop {
            let task = {
                let mut queues = queues.lock();
                match queues.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(task) => task,
                    None => {
                        queues.remove(&key);
                        break;
                    },
                }
            };

            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!(?key, "task panicked");
                if catch_unwind(AssertUnwindSafe(|| on_failure(&key))).is_err() {
                    tracing::error!(?key, "failure hook panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[test]
    fn tasks_with_same_key_run_in_order() {
        let mut pool = KeyedPool::new(4, "test").unwrap();
        let seen = Arc::new(Mutex::new(HashMap::<u64, Vec<usize>>::new()));

        for n in 0..200 {
            let key = (n % 3) as u64;
            let seen = Arc::clone(&seen);
            assert!(pool.submit(key, move || seen.lock().entry(key).or_default().push(n)));
        }
        pool.shutdown().unwrap();

        let seen = seen.lock();
        for key in 0..3u64 {
            let order = &seen[&key];
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(order, &sorted, "key {key} ran out of order");
        }
        assert_eq!(seen.values().map(Vec::len).sum::<usize>(), 200);
    }

    #[test]
    fn tasks_with_same_key_never_overlap() {
        let mut pool = KeyedPool::new(4, "test").unwrap();
        let running = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let running = Arc::clone(&running);
            let overlaps = Arc::clone(&overlaps);
            pool.submit(7u64, move || {
                if running.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::yield_now();
                running.store(false, Ordering::SeqCst);
            });
        }
        pool.shutdown().unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn different_keys_run_in_parallel() {
        let pool = KeyedPool::new(2, "test").unwrap();
        let (a_tx, a_rx) = crossbeam_channel::bounded::<()>(1);
        let (b_tx, b_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<bool>();

        let done = done_tx.clone();
        pool.submit(1u64, move || {
            a_tx.send(()).ok();
            done.send(b_rx.recv_timeout(Duration::from_secs(5)).is_ok()).ok();
        });
        pool.submit(2u64, move || {
            b_tx.send(()).ok();
            done_tx.send(a_rx.recv_timeout(Duration::from_secs(5)).is_ok()).ok();
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(10)).unwrap());
        assert!(done_rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let mut pool = KeyedPool::new(1, "test").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for n in 0..50u64 {
            let count = Arc::clone(&count);
            pool.submit(n, move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 50);
        assert!(!pool.submit(0, || {}));
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_task_does_not_wedge_its_key() {
        let mut pool = KeyedPool::new(1, "test").unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        pool.submit(1u64, || panic!("boom"));
        let flag = Arc::clone(&ran);
        pool.submit(1u64, move || flag.store(true, Ordering::SeqCst));
        pool.shutdown().unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    #[allow(clippy::panic)]
    fn failure_hook_gets_the_panicking_key() {
        let failed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&failed);
        let mut pool =
            KeyedPool::with_failure_hook(2, "test", move |key: &u64| seen.lock().push(*key)).unwrap();

        pool.submit(1u64, || {});
        pool.submit(2u64, || panic!("boom"));
        pool.submit(3u64, || {});
        pool.shutdown().unwrap();

        assert_eq!(*failed.lock(), vec![2]);
    }
}
