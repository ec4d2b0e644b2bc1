//! Executors: a scheduler plus a thread pool
//!
//! An executor multiplexes its workers over a bounded pool of OS threads.
//! A single dispatcher thread waits on a counting semaphore (posted once
//! per push into any owned worker's queue), asks its scheduler for the
//! next ready worker, and hands that worker to the pool as a one-shot
//! "process one message" task.
//!
//! Invariants:
//!
//! - any given worker runs on at most one pool thread at a time (the
//!   worker's running flag; concurrent scheduling requests coalesce),
//! - different workers run in parallel,
//! - a message is never processed twice.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::actions;
use crate::domain::Name;
use crate::error::{Result, SkalError};
use crate::msg::Message;
use crate::scheduler::{create_scheduler, Policy, Scheduler};
use crate::worker::{Handler, StepOutcome, Worker, WorkerConfig};

/// Default number of worker-pool threads per executor
pub const DEFAULT_POOL_SIZE: usize = 4;

// Failsafe sweep period. Semaphore tokens only arrive on pushes, but a
// throttled worker becomes ready again by its xoff timeout lapsing, with
// no push attached; the periodic sweep picks those up.
const DISPATCH_TICK: Duration = Duration::from_millis(25);

/// Executor creation parameters
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Scheduling policy
    pub policy: Policy,
    /// Number of pool threads; must be > 0
    pub pool_size: usize,
    /// Stack size for pool threads; OS default when `None`
    pub stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            policy: Policy::Fair,
            pool_size: DEFAULT_POOL_SIZE,
            stack_size: None,
        }
    }
}

impl ExecutorConfig {
    /// Set the scheduling policy
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the pool size
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }
}

enum Token {
    Ready,
    Shutdown,
}

struct Inner {
    scheduler: Mutex<Box<dyn Scheduler>>,
    sem_tx: Sender<Token>,
    // Taken on shutdown so pool threads see the channel close
    task_tx: Mutex<Option<Sender<Arc<Worker>>>>,
}

impl Inner {
    fn run_one(&self, worker: Arc<Worker>) {
        if !worker.begin_run() {
            // Already on another pool thread; it will repost for us.
            return;
        }
        let outcome = worker.process_step();
        if outcome == StepOutcome::Terminated {
            self.scheduler.lock().remove(worker.name());
        }
        // One step handles one message. Requests coalesced while the
        // worker was running collapse into a single pending bit, and
        // messages that arrived mid-step consumed their tokens on a
        // still-busy worker; either way, a worker that is still ready
        // needs a fresh token or its backlog is stranded.
        if worker.finish_run() || worker.is_ready() {
            let _ = self.sem_tx.send(Token::Ready);
        }
    }

    fn add_worker(&self, config: WorkerConfig, handler: Box<dyn Handler>) -> Result<()> {
        let worker = Worker::create(config, handler)?;
        let sem = self.sem_tx.clone();
        worker.queue().set_notifier(Box::new(move || {
            let _ = sem.send(Token::Ready);
        }));
        self.scheduler.lock().add(Arc::clone(&worker));

        // Uniform first tick for every handler
        worker.queue().push(Message::internal(
            Name::resolve("skal-executor"),
            worker.name().clone(),
            actions::INIT,
        ));
        Ok(())
    }
}

/// A cloneable reference to a live executor
///
/// Used to place workers and groups without owning the executor.
#[derive(Clone)]
pub struct ExecutorHandle {
    inner: Arc<Inner>,
}

impl ExecutorHandle {
    /// Create a worker managed by this executor
    pub fn add_worker(&self, config: WorkerConfig, handler: impl Handler + 'static) -> Result<()> {
        self.inner.add_worker(config, Box::new(handler))
    }
}

/// A scheduler plus a bounded thread pool running workers
pub struct Executor {
    inner: Arc<Inner>,
    dispatcher: Option<JoinHandle<()>>,
    pool: Vec<JoinHandle<()>>,
}

static EXECUTORS: Lazy<Mutex<Vec<Arc<Inner>>>> = Lazy::new(|| Mutex::new(Vec::new()));
static NEXT_EXECUTOR: AtomicUsize = AtomicUsize::new(0);

impl Executor {
    /// Create an executor and start its threads
    pub fn new(config: ExecutorConfig) -> Self {
        assert!(config.pool_size > 0, "executor pool must have threads");
        let (sem_tx, sem_rx) = unbounded::<Token>();
        let (task_tx, task_rx) = unbounded::<Arc<Worker>>();
        let inner = Arc::new(Inner {
            scheduler: Mutex::new(create_scheduler(config.policy)),
            sem_tx,
            task_tx: Mutex::new(Some(task_tx)),
        });

        let dispatcher = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("skal-dispatcher".into())
                .spawn(move || dispatch_loop(&inner, sem_rx))
                .expect("spawn dispatcher thread")
        };

        let mut pool = Vec::with_capacity(config.pool_size);
        for i in 0..config.pool_size {
            let inner = Arc::clone(&inner);
            let task_rx: Receiver<Arc<Worker>> = task_rx.clone();
            let mut builder = thread::Builder::new().name(format!("skal-pool-{i}"));
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }
            let handle = builder
                .spawn(move || {
                    for worker in task_rx.iter() {
                        inner.run_one(worker);
                    }
                })
                .expect("spawn pool thread");
            pool.push(handle);
        }

        EXECUTORS.lock().push(Arc::clone(&inner));
        info!(pool_size = config.pool_size, policy = ?config.policy, "executor started");
        Self {
            inner,
            dispatcher: Some(dispatcher),
            pool,
        }
    }

    /// Create a worker managed by this executor
    pub fn add_worker(&self, config: WorkerConfig, handler: impl Handler + 'static) -> Result<()> {
        self.inner.add_worker(config, Box::new(handler))
    }

    /// A cloneable reference to this executor
    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    fn shutdown(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        EXECUTORS
            .lock()
            .retain(|inner| !Arc::ptr_eq(inner, &self.inner));
        // One extra semaphore post so the dispatcher wakes up to exit
        let _ = self.inner.sem_tx.send(Token::Shutdown);
        let _ = dispatcher.join();
        // Closing the task channel drains the pool
        self.inner.task_tx.lock().take();
        for handle in self.pool.drain(..) {
            let _ = handle.join();
        }
        debug!("executor stopped");
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(inner: &Inner, sem_rx: Receiver<Token>) {
    loop {
        match sem_rx.recv_timeout(DISPATCH_TICK) {
            Ok(Token::Ready) | Err(RecvTimeoutError::Timeout) => {
                let selected = inner.scheduler.lock().select();
                if let Some(worker) = selected {
                    if let Some(task_tx) = inner.task_tx.lock().as_ref() {
                        let _ = task_tx.send(worker);
                    }
                }
            }
            Ok(Token::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Pick an arbitrary live executor, round-robin
///
/// Used to place groups and auxiliary workers when no explicit choice
/// was made.
pub fn pick_any() -> Option<ExecutorHandle> {
    let executors = EXECUTORS.lock();
    if executors.is_empty() {
        return None;
    }
    let index = NEXT_EXECUTOR.fetch_add(1, Ordering::Relaxed) % executors.len();
    Some(ExecutorHandle {
        inner: Arc::clone(&executors[index]),
    })
}

/// Create a worker on an arbitrarily picked executor
pub fn spawn_worker(config: WorkerConfig, handler: impl Handler + 'static) -> Result<()> {
    let name = config.name.clone();
    pick_any()
        .ok_or(SkalError::NoExecutor(name))?
        .add_worker(config, handler)
}
