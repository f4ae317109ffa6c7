//! Background work scheduling.
//!
//! Resource loading runs on worker threads behind the [`Scheduler`] trait. Workers are
//! numbered `0..worker_count()`, and a task can ask which worker it runs on; the index selects
//! the per-worker command pools of every [`Queue`](crate::Queue).
//!
//! [`WorkerPool`] is the provided implementation: a fixed set of named threads fed by two
//! channels. High-priority tasks are always taken before normal ones.

use std::{
    cell::Cell,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::config::RendererConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on a fixed set of worker threads.
pub trait Scheduler: Send + Sync + 'static {
    /// Queues `task` to run on some worker.
    fn schedule(&self, task: Task, priority: Priority);

    fn worker_count(&self) -> usize;

    /// Index of the worker the calling thread belongs to, or `None` when called from a thread
    /// this scheduler does not own.
    fn current_worker(&self) -> Option<usize>;
}

thread_local! {
    /// (pool id, worker index) of the current thread.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

struct Channels {
    high: Sender<Task>,
    normal: Sender<Task>,
}

/// A fixed-size pool of worker threads.
///
/// Dropping the pool stops accepting work, lets the workers drain what is already queued, and
/// joins them.
pub struct WorkerPool {
    id: usize,
    channels: Option<Channels>,
    workers: Vec<JoinHandle<()>>,
    active_task_count: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "A worker pool needs at least one thread");
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (high_tx, high_rx) = crossbeam_channel::unbounded();
        let (normal_tx, normal_rx) = crossbeam_channel::unbounded();
        let active_task_count = Arc::new(AtomicUsize::new(0));

        let workers = (0..worker_count)
            .map(|index| {
                let high = high_rx.clone();
                let normal = normal_rx.clone();
                let active_task_count = active_task_count.clone();
                std::thread::Builder::new()
                    .name(format!("Streaming Worker {index}"))
                    .spawn(move || {
                        CURRENT_WORKER.set(Some((id, index)));
                        while let Some(task) = next_task(&high, &normal) {
                            run_task(task, index);
                            active_task_count.fetch_sub(1, Ordering::Release);
                        }
                    })
                    .unwrap_or_else(|error| panic!("Failed to spawn worker thread: {error}"))
            })
            .collect();
        tracing::debug!(worker_count, "Started worker pool");

        Self {
            id,
            channels: Some(Channels {
                high: high_tx,
                normal: normal_tx,
            }),
            workers,
            active_task_count,
        }
    }

    pub fn from_config(config: &RendererConfig) -> Self {
        Self::new(config.worker_count())
    }

    /// Number of tasks queued or running.
    pub fn active_task_count(&self) -> usize {
        self.active_task_count.load(Ordering::Acquire)
    }
}

/// Blocks for the next task, preferring the high-priority channel. Returns `None` once both
/// channels are disconnected and drained.
fn next_task(high: &Receiver<Task>, normal: &Receiver<Task>) -> Option<Task> {
    match high.try_recv() {
        Ok(task) => return Some(task),
        Err(TryRecvError::Disconnected) => return normal.recv().ok(),
        Err(TryRecvError::Empty) => (),
    }
    crossbeam_channel::select! {
        recv(high) -> task => match task {
            Ok(task) => Some(task),
            Err(_) => normal.recv().ok(),
        },
        recv(normal) -> task => match task {
            Ok(task) => Some(task),
            Err(_) => high.recv().ok(),
        },
    }
}

fn run_task(task: Task, worker: usize) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic>");
        tracing::error!(worker, message, "Worker task panicked");
    }
}

impl Scheduler for WorkerPool {
    fn schedule(&self, task: Task, priority: Priority) {
        let Some(channels) = &self.channels else {
            return;
        };
        let sender = match priority {
            Priority::High => &channels.high,
            Priority::Normal => &channels.normal,
        };
        self.active_task_count.fetch_add(1, Ordering::Release);
        if sender.send(task).is_err() {
            self.active_task_count.fetch_sub(1, Ordering::Release);
            tracing::error!("Worker pool has shut down; task dropped");
        }
    }

    fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn current_worker(&self) -> Option<usize> {
        CURRENT_WORKER
            .get()
            .and_then(|(pool, index)| (pool == self.id).then_some(index))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.channels = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Worker thread panicked outside of a task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Barrier, Mutex};

    use super::*;

    #[test]
    fn test_tasks_run_on_workers() {
        let pool = Arc::new(WorkerPool::new(3));
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.current_worker(), None);
        let (tx, rx) = crossbeam_channel::unbounded();
        for _ in 0..32 {
            let tx = tx.clone();
            let inner = Arc::downgrade(&pool);
            pool.schedule(
                Box::new(move || {
                    let worker = inner.upgrade().and_then(|pool| pool.current_worker());
                    tx.send(worker).unwrap();
                }),
                Priority::Normal,
            );
        }
        drop(tx);
        let seen: Vec<Option<usize>> = rx.iter().collect();
        assert_eq!(seen.len(), 32);
        assert!(seen.iter().all(|w| w.is_some_and(|w| w < 3)));
    }

    #[test]
    fn test_high_priority_runs_first() {
        let pool = WorkerPool::new(1);
        let gate = Arc::new(Barrier::new(2));
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let gate = gate.clone();
            pool.schedule(
                Box::new(move || {
                    gate.wait();
                }),
                Priority::Normal,
            );
        }
        for (label, priority) in [("normal", Priority::Normal), ("high", Priority::High)] {
            let order = order.clone();
            pool.schedule(
                Box::new(move || order.lock().unwrap().push(label)),
                priority,
            );
        }
        gate.wait();
        drop(pool);
        assert_eq!(*order.lock().unwrap(), vec!["high", "normal"]);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        pool.schedule(Box::new(|| panic!("boom")), Priority::Normal);
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.schedule(Box::new(move || tx.send(()).unwrap()), Priority::Normal);
        rx.recv().unwrap();
        drop(pool);
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(2);
        for _ in 0..100 {
            let counter = counter.clone();
            pool.schedule(
                Box::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                }),
                Priority::High,
            );
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }
}
