//! Prioritized worker pools.
//!
//! Jobs run on fixed-size pools of OS threads that pick the highest [`Priority`] task first,
//! and the oldest one among equal priorities. Each pool has a bounded queue and a
//! [`RejectionPolicy`] for tasks that do not fit.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use sentry::Hub;
use serde::Deserialize;

use crate::config::{ExecutorConfig, ExecutorConfigs};
use crate::error::ExecutorError;
use crate::types::Priority;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Called instead of a [`Task`] that will never run.
pub type RejectHandler = Box<dyn FnOnce(ExecutorError) + Send + 'static>;

/// What happens to a task that does not fit into a full queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Runs the task inline on the submitting thread.
    CallerRuns,
    /// Drops the lowest priority queued task if the new task outranks it.
    DiscardLowest,
    /// Returns [`ExecutorError::Rejected`].
    Reject,
}

/// What happens when a task panics.
///
/// The worker thread survives either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicStrategy {
    Ignore,
    Log,
}

/// Something that can run completion callbacks.
pub trait CallbackExecutor: Send + Sync {
    fn dispatch(&self, task: Task);
}

/// Runs callbacks inline on the completing thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectExecutor;

impl CallbackExecutor for DirectExecutor {
    fn dispatch(&self, task: Task) {
        task()
    }
}

/// A task together with what to do if it is dropped unexecuted.
struct Job {
    task: Task,
    on_reject: Option<RejectHandler>,
}

impl Job {
    fn reject(self, error: ExecutorError) {
        if let Some(on_reject) = self.on_reject {
            on_reject(error);
        }
    }
}

struct QueuedTask {
    priority: Priority,
    seq: u64,
    job: Job,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    live_workers: usize,
    shutdown: bool,
}

struct Shared {
    name: String,
    config: ExecutorConfig,
    queue: Mutex<Queue>,
    available: Condvar,
    finished: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, task: Task) {
        let result = catch_unwind(AssertUnwindSafe(task));
        if result.is_err() && self.config.panic == PanicStrategy::Log {
            tracing::error!(executor = %self.name, "task panicked");
        }
    }

    fn work(&self) {
        loop {
            let task = {
                let mut queue = self.lock();
                loop {
                    if let Some(task) = queue.heap.pop() {
                        break Some(task);
                    }
                    if queue.shutdown {
                        break None;
                    }
                    queue = self
                        .available
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            match task {
                Some(queued) => self.run(queued.job.task),
                None => break,
            }
        }

        let mut queue = self.lock();
        queue.live_workers -= 1;
        self.finished.notify_all();
    }
}

/// A named, fixed-size pool of threads executing tasks by priority.
pub struct PriorityExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityExecutor {
    /// Spawns the worker threads of a new pool.
    pub fn new(name: &str, config: &ExecutorConfig) -> Self {
        let threads = config.threads.max(1);
        let shared = Arc::new(Shared {
            name: name.to_owned(),
            config: *config,
            queue: Mutex::new(Queue {
                live_workers: threads,
                ..Default::default()
            }),
            available: Condvar::new(),
            finished: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("bitmill-{name}-{i}"))
                .spawn(move || worker.work());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    tracing::error!(
                        executor = name,
                        error = &error as &dyn std::error::Error,
                        "failed to spawn worker thread"
                    );
                    shared.lock().live_workers -= 1;
                }
            }
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Schedules `f` to run with the given priority.
    ///
    /// The current sentry hub is carried over to the worker thread.
    pub fn execute<F>(&self, priority: Priority, f: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Job {
            task: Self::with_hub(f),
            on_reject: None,
        };
        self.try_execute(priority, job).map_err(|(error, _)| error)
    }

    /// Schedules `f` like [`execute`](Self::execute), calling `on_reject` instead if `f` will
    /// never run.
    ///
    /// This covers tasks that are rejected right away as well as queued tasks that are
    /// discarded later on in favor of more important ones.
    pub fn execute_or_reject<F, R>(&self, priority: Priority, f: F, on_reject: R)
    where
        F: FnOnce() + Send + 'static,
        R: FnOnce(ExecutorError) + Send + 'static,
    {
        let job = Job {
            task: Self::with_hub(f),
            on_reject: Some(Box::new(on_reject)),
        };
        if let Err((error, job)) = self.try_execute(priority, job) {
            job.reject(error);
        }
    }

    fn with_hub<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        let hub = Hub::current();
        Box::new(move || Hub::run(hub, f))
    }

    /// Schedules a job, handing it back if it was neither queued nor run.
    fn try_execute(&self, priority: Priority, job: Job) -> Result<(), (ExecutorError, Job)> {
        let mut queue = self.shared.lock();
        if queue.shutdown || queue.live_workers == 0 {
            return Err((ExecutorError::ShutDown(self.shared.name.clone()), job));
        }

        let mut discarded = None;

        if queue.heap.len() >= self.shared.config.queue_capacity.max(1) {
            match self.shared.config.rejection {
                RejectionPolicy::CallerRuns => {
                    drop(queue);
                    metric!(counter("executor.rejected") += 1, "executor" => self.name(), "policy" => "caller_runs");
                    self.shared.run(job.task);
                    return Ok(());
                }
                RejectionPolicy::DiscardLowest => {
                    let lowest = queue.heap.iter().min().map(|lowest| lowest.priority);
                    if lowest.is_none_or(|lowest| lowest >= priority) {
                        metric!(counter("executor.rejected") += 1, "executor" => self.name(), "policy" => "discard_lowest");
                        return Err((ExecutorError::Rejected(self.shared.name.clone()), job));
                    }
                    let mut tasks = std::mem::take(&mut queue.heap).into_vec();
                    if let Some(index) = tasks
                        .iter()
                        .enumerate()
                        .min_by(|a, b| a.1.cmp(b.1))
                        .map(|(index, _)| index)
                    {
                        let lowest = tasks.swap_remove(index);
                        tracing::debug!(
                            executor = %self.shared.name,
                            priority = ?lowest.priority,
                            "discarded queued task"
                        );
                        discarded = Some(lowest.job);
                    }
                    queue.heap = BinaryHeap::from(tasks);
                    metric!(counter("executor.rejected") += 1, "executor" => self.name(), "policy" => "discard_lowest");
                }
                RejectionPolicy::Reject => {
                    metric!(counter("executor.rejected") += 1, "executor" => self.name(), "policy" => "reject");
                    return Err((ExecutorError::Rejected(self.shared.name.clone()), job));
                }
            }
        }

        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(QueuedTask { priority, seq, job });
        drop(queue);
        self.shared.available.notify_one();

        // outside of the lock, the handler may schedule new work
        if let Some(job) = discarded {
            job.reject(ExecutorError::Discarded(self.shared.name.clone()));
        }
        Ok(())
    }

    /// The number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().heap.len()
    }

    /// Stops accepting tasks and waits for the workers to drain the queue.
    ///
    /// Workers still busy after the configured `shutdown_timeout` are detached.
    pub fn shutdown(&self) {
        let mut queue = self.shared.lock();
        if !queue.shutdown {
            queue.shutdown = true;
            self.shared.available.notify_all();
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers
            .iter()
            .any(|worker| worker.thread().id() == thread::current().id())
        {
            // A worker cannot wait for itself. The others exit once the queue is drained.
            workers.clear();
            return;
        }
        drop(workers);

        let (queue, timeout) = self
            .shared
            .finished
            .wait_timeout_while(queue, self.shared.config.shutdown_timeout, |queue| {
                queue.live_workers > 0
            })
            .unwrap_or_else(PoisonError::into_inner);
        drop(queue);

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if timeout.timed_out() {
            tracing::warn!(
                executor = %self.shared.name,
                "workers did not finish in time, detaching"
            );
            return;
        }
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl CallbackExecutor for PriorityExecutor {
    fn dispatch(&self, task: Task) {
        // Callbacks are never lost: if the pool cannot take them they run inline. Queued at
        // the highest priority, they are never discarded for another task.
        let job = Job {
            task,
            on_reject: None,
        };
        if let Err((error, job)) = self.try_execute(Priority::Immediate, job) {
            tracing::debug!(
                error = &error as &dyn std::error::Error,
                "running callback inline"
            );
            (job.task)();
        }
    }
}

impl Drop for PriorityExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PriorityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityExecutor")
            .field("name", &self.shared.name)
            .field("threads", &self.shared.config.threads)
            .finish()
    }
}

/// The pools a [`DecodeJob`](crate::decode::DecodeJob) hops between.
#[derive(Clone, Debug)]
pub struct Executors {
    /// Reads and writes the disk cache.
    pub disk_cache: Arc<PriorityExecutor>,
    /// Fetches and decodes source data.
    pub source: Arc<PriorityExecutor>,
    /// Decodes animation frames.
    pub animation: Arc<PriorityExecutor>,
}

impl Executors {
    pub fn new(config: &ExecutorConfigs) -> Self {
        Self {
            disk_cache: Arc::new(PriorityExecutor::new("disk-cache", &config.disk_cache)),
            source: Arc::new(PriorityExecutor::new("source", &config.source)),
            animation: Arc::new(PriorityExecutor::new("animation", &config.animation)),
        }
    }

    pub fn shutdown(&self) {
        self.disk_cache.shutdown();
        self.source.shutdown();
        self.animation.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    fn config(threads: usize, queue_capacity: usize, rejection: RejectionPolicy) -> ExecutorConfig {
        ExecutorConfig {
            threads,
            queue_capacity,
            rejection,
            ..Default::default()
        }
    }

    /// Occupies the single worker of `executor` until the returned sender is dropped.
    fn block_worker(executor: &PriorityExecutor) -> mpsc::Sender<()> {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        executor
            .execute(Priority::Immediate, move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    #[test]
    fn test_priority_then_fifo() {
        let executor = PriorityExecutor::new("test", &config(1, 16, RejectionPolicy::Reject));
        let release = block_worker(&executor);

        let (tx, rx) = mpsc::channel();
        let submissions = [
            (Priority::Low, "low"),
            (Priority::Normal, "normal-1"),
            (Priority::Immediate, "immediate"),
            (Priority::Normal, "normal-2"),
            (Priority::High, "high"),
        ];
        for (priority, name) in submissions {
            let tx = tx.clone();
            executor
                .execute(priority, move || tx.send(name).unwrap())
                .unwrap();
        }
        drop(release);

        let order: Vec<_> = (0..submissions.len())
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, ["immediate", "high", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn test_reject_when_full() {
        let executor = PriorityExecutor::new("test", &config(1, 1, RejectionPolicy::Reject));
        let release = block_worker(&executor);

        executor.execute(Priority::Normal, || {}).unwrap();
        let result = executor.execute(Priority::Normal, || {});
        assert_eq!(result, Err(ExecutorError::Rejected("test".into())));
        drop(release);
    }

    #[test]
    fn test_caller_runs_when_full() {
        let executor = PriorityExecutor::new("test", &config(1, 1, RejectionPolicy::CallerRuns));
        let release = block_worker(&executor);

        executor.execute(Priority::Normal, || {}).unwrap();
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        executor
            .execute(Priority::Normal, move || {
                tx.send(thread::current().id()).unwrap()
            })
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), caller);
        drop(release);
    }

    #[test]
    fn test_discard_lowest() {
        let executor =
            PriorityExecutor::new("test", &config(1, 1, RejectionPolicy::DiscardLowest));
        let release = block_worker(&executor);

        let (tx, rx) = mpsc::channel();
        let low = tx.clone();
        executor
            .execute(Priority::Low, move || low.send("low").unwrap())
            .unwrap();

        // equal priority does not outrank the queued task
        assert!(executor.execute(Priority::Low, || {}).is_err());

        let high = tx.clone();
        executor
            .execute(Priority::High, move || high.send("high").unwrap())
            .unwrap();
        drop(tx);
        drop(release);

        let ran: Vec<_> = rx.iter().collect();
        assert_eq!(ran, ["high"]);
    }

    #[test]
    fn test_discarded_task_is_rejected() {
        let executor =
            PriorityExecutor::new("test", &config(1, 1, RejectionPolicy::DiscardLowest));
        let release = block_worker(&executor);

        let (tx, rx) = mpsc::channel();
        let ran = tx.clone();
        let rejected = tx.clone();
        executor.execute_or_reject(
            Priority::Low,
            move || ran.send("low ran".to_owned()).unwrap(),
            move |error| rejected.send(error.to_string()).unwrap(),
        );
        assert!(rx.try_recv().is_err());

        let high = tx.clone();
        executor
            .execute(Priority::High, move || high.send("high ran".to_owned()).unwrap())
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            ExecutorError::Discarded("test".into()).to_string()
        );

        // rejected right away, without queueing
        let rejected = tx.clone();
        executor.execute_or_reject(
            Priority::Low,
            || {},
            move |error| rejected.send(error.to_string()).unwrap(),
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ExecutorError::Rejected("test".into()).to_string()
        );

        drop(tx);
        drop(release);
        let ran: Vec<_> = rx.iter().collect();
        assert_eq!(ran, ["high ran"]);
    }

    #[test]
    fn test_survives_panics() {
        let executor = PriorityExecutor::new("test", &config(1, 16, RejectionPolicy::Reject));
        executor
            .execute(Priority::Normal, || panic!("boom"))
            .unwrap();

        let (tx, rx) = mpsc::channel();
        executor
            .execute(Priority::Normal, move || tx.send(()).unwrap())
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let executor = PriorityExecutor::new("test", &config(2, 16, RejectionPolicy::Reject));
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            executor
                .execute(Priority::Normal, move || tx.send(i).unwrap())
                .unwrap();
        }
        drop(tx);
        executor.shutdown();

        assert_eq!(rx.iter().count(), 8);
        assert_eq!(
            executor.execute(Priority::Normal, || {}),
            Err(ExecutorError::ShutDown("test".into()))
        );
    }
}
