//! Scheduling policies
//!
//! A scheduler selects the next worker to run among the workers of one
//! executor. Implementations must only return workers that have a
//! poppable message given their current throttle state.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::domain::Name;
use crate::worker::Worker;

/// How to schedule workers when there is contention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// Worker with the most pending messages first; bounded unfairness
    #[default]
    Fair,
    /// Each ready worker in turn
    Carousel,
    /// Higher worker priority first
    Priority,
}

/// A scheduling policy instance
///
/// Implementations must be usable from the dispatcher thread while
/// workers are added and removed from others; the executor serializes
/// access with a lock, so no internal synchronization is needed.
pub trait Scheduler: Send {
    /// Add a worker to the schedulable set
    fn add(&mut self, worker: Arc<Worker>);

    /// Remove a worker by name; no-op when absent
    fn remove(&mut self, name: &Name);

    /// Select the next worker to run
    ///
    /// Returns a worker with at least one poppable message, or `None`
    /// when nobody is ready. Must never return a worker that is
    /// currently being run: the executor reschedules busy workers
    /// itself when their step ends, and selecting one here only burns
    /// the dispatch token another ready worker needed.
    fn select(&mut self) -> Option<Arc<Worker>>;
}

/// Instantiate the given policy
pub fn create_scheduler(policy: Policy) -> Box<dyn Scheduler> {
    match policy {
        Policy::Fair => Box::new(FairScheduler::default()),
        Policy::Carousel => Box::new(CarouselScheduler::default()),
        Policy::Priority => Box::new(PriorityScheduler::default()),
    }
}

/// A throttled worker with pending internal traffic goes first: that is
/// how xon messages get through. Otherwise the deepest queue wins, which
/// bounds how far behind any single worker can fall.
#[derive(Default)]
struct FairScheduler {
    // Insertion order; ties go to the earliest added
    workers: Vec<Arc<Worker>>,
}

impl Scheduler for FairScheduler {
    fn add(&mut self, worker: Arc<Worker>) {
        self.workers.push(worker);
    }

    fn remove(&mut self, name: &Name) {
        self.workers.retain(|w| w.name() != name);
    }

    fn select(&mut self) -> Option<Arc<Worker>> {
        for worker in &self.workers {
            if worker.is_running() {
                continue;
            }
            if worker.is_blocked() && worker.queue().internal_len() > 0 {
                return Some(Arc::clone(worker));
            }
        }
        let mut best: Option<&Arc<Worker>> = None;
        for worker in &self.workers {
            if worker.is_running() || worker.is_blocked() || !worker.is_ready() {
                continue;
            }
            match best {
                Some(current) if worker.queue().len() <= current.queue().len() => {}
                _ => best = Some(worker),
            }
        }
        best.cloned()
    }
}

/// Plain round-robin over ready workers.
#[derive(Default)]
struct CarouselScheduler {
    workers: VecDeque<Arc<Worker>>,
}

impl Scheduler for CarouselScheduler {
    fn add(&mut self, worker: Arc<Worker>) {
        self.workers.push_back(worker);
    }

    fn remove(&mut self, name: &Name) {
        self.workers.retain(|w| w.name() != name);
    }

    fn select(&mut self) -> Option<Arc<Worker>> {
        for _ in 0..self.workers.len() {
            let worker = self.workers.pop_front().expect("non-empty rotation");
            self.workers.push_back(Arc::clone(&worker));
            if !worker.is_running() && worker.is_ready() {
                return Some(worker);
            }
        }
        None
    }
}

/// Highest worker priority first; throttled workers with internal
/// traffic still take precedence, as in the fair policy.
#[derive(Default)]
struct PriorityScheduler {
    workers: Vec<Arc<Worker>>,
}

impl Scheduler for PriorityScheduler {
    fn add(&mut self, worker: Arc<Worker>) {
        self.workers.push(worker);
    }

    fn remove(&mut self, name: &Name) {
        self.workers.retain(|w| w.name() != name);
    }

    fn select(&mut self) -> Option<Arc<Worker>> {
        for worker in &self.workers {
            if worker.is_running() {
                continue;
            }
            if worker.is_blocked() && worker.queue().internal_len() > 0 {
                return Some(Arc::clone(worker));
            }
        }
        let mut best: Option<&Arc<Worker>> = None;
        for worker in &self.workers {
            if worker.is_running() || worker.is_blocked() || !worker.is_ready() {
                continue;
            }
            match best {
                Some(current) if worker.priority() <= current.priority() => {}
                _ => best = Some(worker),
            }
        }
        best.cloned()
    }
}
