//! Per-stage thread pools.
//!
//! Each registered stage gets its own pool of workers. A worker loops on
//! the stage's batch sorter, runs the handler against every batch it gets,
//! records the elapsed time and lets the stage's controller react. Pools
//! grow when the backlog after a fetch exceeds `grow_backlog` and shrink
//! when workers stay idle longer than `idle_timeout`.

use crate::config::ThreadPoolConfig;
use crate::error::{QueueError, Result, RuntimeError};
use crate::queue::deadline_after;
use crate::sorter::Batch;
use crate::stage::Stage;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of a stage's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    NotStarted,
    Running,
    ShuttingDown,
    Terminated,
}

/// What to do when a handler fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log, count the batch as consumed and keep going
    #[default]
    Continue,
    /// Terminate the process
    Crash,
}

impl FailurePolicy {
    pub fn from_crash_flag(crash_on_exception: bool) -> Self {
        if crash_on_exception {
            FailurePolicy::Crash
        } else {
            FailurePolicy::Continue
        }
    }
}

#[derive(Debug)]
struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn is_active(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct Workers {
    state: PoolState,
    entries: HashMap<usize, Worker>,
    next_id: usize,
    largest: usize,
}

impl Workers {
    fn active(&self) -> usize {
        self.entries.values().filter(|w| w.is_active()).count()
    }
}

struct PoolShared<E> {
    stage: Arc<Stage<E>>,
    config: ThreadPoolConfig,
    policy: FailurePolicy,
    workers: Mutex<Workers>,
    exits_tx: Sender<usize>,
    exits_rx: Receiver<usize>,
}

/// Elastic pool of workers serving one stage
pub struct ThreadPool<E> {
    shared: Arc<PoolShared<E>>,
}

impl<E> Clone for ThreadPool<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Send + 'static> ThreadPool<E> {
    pub fn new(stage: Arc<Stage<E>>, policy: FailurePolicy) -> Self {
        let mut config = stage.pool_config().clone();
        if stage.is_single_threaded() {
            config = config.single_threaded();
        }
        let (exits_tx, exits_rx) = channel::unbounded();
        Self {
            shared: Arc::new(PoolShared {
                stage,
                config: config.normalized(),
                policy,
                workers: Mutex::new(Workers {
                    state: PoolState::NotStarted,
                    entries: HashMap::new(),
                    next_id: 0,
                    largest: 0,
                }),
                exits_tx,
                exits_rx,
            }),
        }
    }

    pub fn stage(&self) -> &Arc<Stage<E>> {
        &self.shared.stage
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PoolState {
        self.shared.workers.lock().state
    }

    /// Workers currently serving the stage
    pub fn current_size(&self) -> usize {
        self.shared.workers.lock().active()
    }

    /// Highest number of concurrent workers seen
    pub fn largest_pool_size(&self) -> usize {
        self.shared.workers.lock().largest
    }

    /// Spin up the initial workers
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let mut workers = shared.workers.lock();
        if workers.state != PoolState::NotStarted {
            return Err(RuntimeError::AlreadyRegistered(shared.stage.name().to_string()));
        }
        shared
            .stage
            .sorter()
            .init(shared.stage.name(), shared.config.max_threads);
        workers.state = PoolState::Running;
        for _ in 0..shared.config.initial_threads {
            shared.spawn_worker(&mut workers)?;
        }
        info!(
            stage = %shared.stage.name(),
            threads = shared.config.initial_threads,
            min = shared.config.min_threads,
            max = shared.config.max_threads,
            "Thread pool started"
        );
        Ok(())
    }

    /// Resize to `size` workers, clamped into the configured bounds
    ///
    /// Excess workers finish their current batch before exiting.
    pub fn set_pool_size(&self, size: usize) -> Result<usize> {
        let shared = &self.shared;
        let size = size.clamp(shared.config.min_threads, shared.config.max_threads);
        let mut workers = shared.workers.lock();
        if workers.state != PoolState::Running {
            return Ok(workers.active());
        }
        let active = workers.active();
        if size > active {
            for _ in active..size {
                shared.spawn_worker(&mut workers)?;
            }
        } else if size < active {
            workers
                .entries
                .values()
                .filter(|w| w.is_active())
                .take(active - size)
                .for_each(|w| w.stop.store(true, Ordering::Release));
        }
        info!(stage = %shared.stage.name(), from = active, to = size, "Thread pool resized");
        Ok(size)
    }

    /// Stop all workers, waiting up to `termination_timeout` for in-flight batches
    pub fn shutdown(&self) {
        let shared = &self.shared;
        {
            let mut workers = shared.workers.lock();
            match workers.state {
                PoolState::ShuttingDown | PoolState::Terminated => return,
                PoolState::NotStarted => {
                    workers.state = PoolState::Terminated;
                    return;
                }
                PoolState::Running => {}
            }
            workers.state = PoolState::ShuttingDown;
            for worker in workers.entries.values() {
                worker.stop.store(true, Ordering::Release);
            }
        }

        let deadline = deadline_after(shared.config.termination_timeout);
        loop {
            let mut workers = shared.workers.lock();
            while let Ok(id) = shared.exits_rx.try_recv() {
                reap(&mut workers, id);
            }
            if workers.entries.is_empty() {
                break;
            }
            drop(workers);
            let exited = match deadline {
                Some(deadline) => shared.exits_rx.recv_deadline(deadline),
                None => shared
                    .exits_rx
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match exited {
                Ok(id) => reap(&mut shared.workers.lock(), id),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut workers = shared.workers.lock();
        let remaining = workers.entries.len();
        if remaining > 0 {
            warn!(
                stage = %shared.stage.name(),
                remaining,
                timeout_ms = shared.config.termination_timeout.as_millis() as u64,
                "Thread pool did not terminate in time; detaching workers"
            );
            workers.entries.clear();
        }
        workers.state = PoolState::Terminated;
        info!(stage = %shared.stage.name(), "Thread pool terminated");
    }
}

fn reap(workers: &mut Workers, id: usize) {
    if let Some(mut worker) = workers.entries.remove(&id) {
        if let Some(handle) = worker.handle.take() {
            if handle.join().is_err() {
                warn!(worker = id, "Worker thread panicked");
            }
        }
    }
}

impl<E> std::fmt::Debug for ThreadPool<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let workers = self.shared.workers.lock();
        f.debug_struct("ThreadPool")
            .field("stage", &self.shared.stage.name())
            .field("state", &workers.state)
            .field("active", &workers.active())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl<E: Send + 'static> PoolShared<E> {
    /// Caller holds the workers lock so the entry is in place before the thread can exit
    fn spawn_worker(self: &Arc<Self>, workers: &mut Workers) -> Result<()> {
        while let Ok(exited) = self.exits_rx.try_recv() {
            reap(workers, exited);
        }
        let id = workers.next_id;
        workers.next_id += 1;
        let stop = Arc::new(AtomicBool::new(false));

        let shared = Arc::clone(self);
        let worker_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{}", self.stage.name(), id))
            .spawn(move || {
                let _exit = ExitGuard {
                    id,
                    stop: Arc::clone(&worker_stop),
                    exits: shared.exits_tx.clone(),
                };
                shared.run_worker(&worker_stop);
            })
            .map_err(|e| RuntimeError::ThreadSpawn(e.to_string()))?;

        workers.entries.insert(
            id,
            Worker {
                stop,
                handle: Some(handle),
            },
        );
        workers.largest = workers.largest.max(workers.active());
        debug!(stage = %self.stage.name(), worker = id, "Worker spawned");
        Ok(())
    }

    fn run_worker(self: &Arc<Self>, stop: &AtomicBool) {
        let stage = &self.stage;
        let mut idle_since = Instant::now();
        while !stop.load(Ordering::Acquire) {
            match stage.sorter().next_batch(self.config.block_time) {
                Ok(Some(batch)) => {
                    self.run_batch(batch);
                    idle_since = Instant::now();
                    self.maybe_grow();
                }
                Ok(None) => {
                    if idle_since.elapsed() >= self.config.idle_timeout && self.try_retire(stop) {
                        debug!(stage = %stage.name(), "Idle worker retired");
                        break;
                    }
                }
                Err(QueueError::Closed) => break,
                Err(err) => {
                    warn!(stage = %stage.name(), error = %err, "Batch fetch failed");
                    break;
                }
            }
        }
    }

    fn run_batch(&self, batch: Batch<E>) {
        let stage = &self.stage;
        let (events, completion) = batch.into_parts();
        let count = events.len();

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            stage.handler().handle_events(events)
        }));
        let elapsed = started.elapsed();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(reason) = failure {
            stage.stats().record_handler_failure();
            error!(stage = %stage.name(), events = count, error = %reason, "Event handler failed");
            if self.policy == FailurePolicy::Crash {
                error!(stage = %stage.name(), "Crash on exception enabled; terminating process");
                std::process::exit(1);
            }
        }

        stage.stats().record_service_rate(count, elapsed);
        if let Some(controller) = stage.controller() {
            controller.observe(stage.stats());
        }
        completion.done();
    }

    fn maybe_grow(self: &Arc<Self>) {
        let Some(backlog) = self.config.grow_backlog else {
            return;
        };
        if self.stage.queue().len() <= backlog {
            return;
        }
        let mut workers = self.workers.lock();
        if workers.state != PoolState::Running || workers.active() >= self.config.max_threads {
            return;
        }
        match self.spawn_worker(&mut workers) {
            Ok(()) => debug!(
                stage = %self.stage.name(),
                size = workers.active(),
                "Thread pool grown on backlog"
            ),
            Err(err) => warn!(stage = %self.stage.name(), error = %err, "Failed to grow thread pool"),
        }
    }

    fn try_retire(&self, stop: &AtomicBool) -> bool {
        let workers = self.workers.lock();
        if workers.active() <= self.config.min_threads {
            return false;
        }
        stop.store(true, Ordering::Release);
        true
    }
}

/// Marks the worker inactive and reports its exit, even on unwind
struct ExitGuard {
    id: usize,
    stop: Arc<AtomicBool>,
    exits: Sender<usize>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.exits.send(self.id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic".to_string()
    }
}

/// Owns one thread pool per registered stage
pub struct Scheduler<E> {
    pools: Mutex<HashMap<String, ThreadPool<E>>>,
    policy: FailurePolicy,
}

impl<E: Send + 'static> Scheduler<E> {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Start serving `stage` with a fresh pool
    pub fn register(&self, stage: Arc<Stage<E>>) -> Result<ThreadPool<E>> {
        let mut pools = self.pools.lock();
        if pools.contains_key(stage.name()) {
            return Err(RuntimeError::AlreadyRegistered(stage.name().to_string()));
        }
        let pool = ThreadPool::new(stage, self.policy);
        pool.start()?;
        pools.insert(pool.stage().name().to_string(), pool.clone());
        Ok(pool)
    }

    /// Shut down the stage's pool; unknown names are ignored
    pub fn deregister(&self, name: &str) -> bool {
        let pool = self.pools.lock().remove(name);
        match pool {
            Some(pool) => {
                pool.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn deregister_all(&self) {
        let pools: Vec<_> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.shutdown();
        }
    }

    pub fn pool(&self, name: &str) -> Option<ThreadPool<E>> {
        self.pools.lock().get(name).cloned()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.pools.lock().keys().cloned().collect()
    }
}

impl<E: Send + 'static> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new(FailurePolicy::default())
    }
}

impl<E> std::fmt::Debug for Scheduler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("stages", &self.pools.lock().len())
            .field("policy", &self.policy)
            .finish()
    }
}
