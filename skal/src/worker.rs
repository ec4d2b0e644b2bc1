//! Workers: named actors with a queue and a handler
//!
//! A worker owns a message queue and a user handler. The executor invokes
//! the worker one message at a time; the worker itself never spins on a
//! thread. Throttling is cooperative: when a worker's queue fills up, the
//! runtime sends `skal-xoff` to the offending sender, which is expected to
//! hold off non-internal traffic until `skal-xon` (or until the xoff
//! timeout lapses with no fresh evidence).
//!
//! [`send`] is the single delivery entry point: it consumes the message,
//! attempts in-process delivery through the worker registry and falls back
//! to the router hook.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::actions;
use crate::alarm::{self, Alarm, Severity};
use crate::domain::{self, Name, WorkerScope};
use crate::error::{Result, SkalError};
use crate::msg::{Message, MsgFlags};
use crate::queue::MsgQueue;
use crate::router;

/// Default queue threshold for new workers
pub const DEFAULT_QUEUE_THRESHOLD: usize = 100;

/// Default xoff timeout: how long a worker stays throttled without fresh
/// `skal-xoff` evidence
pub const DEFAULT_XOFF_TIMEOUT: Duration = Duration::from_millis(50);

/// What the handler wants after processing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Keep the worker running
    Continue,
    /// Terminate the worker cleanly
    Stop,
}

/// A worker's message handler
///
/// Handlers run synchronously on a pool thread and must not perform long
/// blocking waits; a slow handler stalls every other worker sharing the
/// pool thread.
pub trait Handler: Send {
    /// Process one owned message
    fn on_message(&mut self, msg: Message) -> Control;
}

impl<F> Handler for F
where
    F: FnMut(Message) -> Control + Send,
{
    fn on_message(&mut self, msg: Message) -> Control {
        self(msg)
    }
}

/// Worker creation parameters
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker name; resolved against the process domain
    pub name: String,
    /// Queue threshold driving the back-pressure protocol; must be > 0
    pub queue_threshold: usize,
    /// Throttle failsafe; must be > 0
    pub xoff_timeout: Duration,
    /// Relative priority, used by the priority scheduling policy
    pub priority: i32,
    /// NUMA placement hint; the built-in executor ignores it
    pub numa_node: Option<u32>,
    /// Stack size hint for the threads running this worker; the built-in
    /// executor sizes its pool threads at executor level instead
    pub stack_size: Option<usize>,
}

impl WorkerConfig {
    /// Config with default threshold, timeout and priority
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_threshold: DEFAULT_QUEUE_THRESHOLD,
            xoff_timeout: DEFAULT_XOFF_TIMEOUT,
            priority: 0,
            numa_node: None,
            stack_size: None,
        }
    }

    /// Set the queue threshold
    pub fn queue_threshold(mut self, threshold: usize) -> Self {
        self.queue_threshold = threshold;
        self
    }

    /// Set the xoff timeout
    pub fn xoff_timeout(mut self, timeout: Duration) -> Self {
        self.xoff_timeout = timeout;
        self
    }

    /// Set the worker priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Default)]
struct Throttle {
    /// Peers that told us to stop sending to them
    blocked_by: HashSet<Name>,
    /// When the most recent xoff arrived
    last_xoff: Option<Instant>,
    /// Peers to send `skal-xon` to once we drain
    notify_on_drain: HashSet<Name>,
}

/// Outcome of a single process step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Continued,
    Terminated,
}

/// A named actor with a private queue and a handler
pub struct Worker {
    name: Name,
    priority: i32,
    queue: MsgQueue,
    xoff_timeout: Duration,
    handler: Mutex<Box<dyn Handler>>,
    throttle: Mutex<Throttle>,
    running: AtomicBool,
    pending: AtomicBool,
    terminated: AtomicBool,
}

static REGISTRY: Lazy<DashMap<Name, Arc<Worker>>> = Lazy::new(DashMap::new);
static LIVE: Lazy<(Mutex<usize>, Condvar)> = Lazy::new(|| (Mutex::new(0), Condvar::new()));

impl Worker {
    /// Create a worker and add it to the process-wide registry
    pub(crate) fn create(config: WorkerConfig, handler: Box<dyn Handler>) -> Result<Arc<Worker>> {
        assert!(!config.name.is_empty(), "worker name must not be empty");
        assert!(
            config.xoff_timeout > Duration::ZERO,
            "xoff timeout must be > 0"
        );
        let name = Name::resolve(&config.name);
        let worker = Arc::new(Worker {
            name: name.clone(),
            priority: config.priority,
            queue: MsgQueue::new(config.queue_threshold),
            xoff_timeout: config.xoff_timeout,
            handler: Mutex::new(handler),
            throttle: Mutex::new(Throttle::default()),
            running: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });

        match REGISTRY.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SkalError::DuplicateName(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&worker));
            }
        }
        *LIVE.0.lock() += 1;
        debug!(worker = %name, "created and registered worker");

        if router::is_installed() {
            send(Message::internal(
                name.clone(),
                Name::resolve(domain::ROUTER_NAME),
                actions::BORN,
            ));
        }
        Ok(worker)
    }

    /// Worker's full name
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Worker's scheduling priority
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The worker's message queue
    pub fn queue(&self) -> &MsgQueue {
        &self.queue
    }

    /// Whether the worker is currently throttled
    ///
    /// True while at least one peer has sent `skal-xoff` and the xoff
    /// timeout has not lapsed since the most recent one.
    pub fn is_blocked(&self) -> bool {
        let throttle = self.throttle.lock();
        if throttle.blocked_by.is_empty() {
            return false;
        }
        matches!(throttle.last_xoff, Some(at) if at.elapsed() < self.xoff_timeout)
    }

    /// Whether a process step would find a message to pop
    pub fn is_ready(&self) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        if self.is_blocked() {
            self.queue.internal_len() > 0
        } else {
            !self.queue.is_empty()
        }
    }

    /// Whether a pool thread is currently executing this worker
    ///
    /// Schedulers skip running workers: handing one to the pool again
    /// would waste the dispatch token, and the executor reschedules the
    /// worker itself when its step ends.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the per-worker "currently running" flag
    ///
    /// Returns false if another pool thread already runs this worker; the
    /// request is remembered and surfaced again by [`finish_run`].
    pub(crate) fn begin_run(&self) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            self.pending.store(true, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// Release the running flag; returns whether a coalesced scheduling
    /// request arrived while the worker was running.
    pub(crate) fn finish_run(&self) -> bool {
        self.running.store(false, Ordering::Release);
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Process at most one message
    pub(crate) fn process_step(&self) -> StepOutcome {
        let internal_only = {
            let mut throttle = self.throttle.lock();
            if throttle.blocked_by.is_empty() {
                false
            } else {
                match throttle.last_xoff {
                    Some(at) if at.elapsed() < self.xoff_timeout => true,
                    _ => {
                        // No fresh xoff evidence: treat the silence as
                        // consent and resume.
                        throttle.blocked_by.clear();
                        false
                    }
                }
            }
        };

        let Some(msg) = self.queue.pop(internal_only) else {
            return StepOutcome::Continued;
        };

        let _scope = WorkerScope::enter(self.name.clone());
        let mut terminated = false;
        if msg.is_internal() {
            match msg.action() {
                actions::XOFF => {
                    let mut throttle = self.throttle.lock();
                    throttle.blocked_by.insert(msg.sender().clone());
                    throttle.last_xoff = Some(Instant::now());
                    debug!(worker = %self.name, by = %msg.sender(), "throttled");
                }
                actions::XON => {
                    self.throttle.lock().blocked_by.remove(msg.sender());
                    debug!(worker = %self.name, by = %msg.sender(), "resumed");
                }
                actions::TERMINATE => terminated = true,
                _ => terminated = self.invoke_handler(msg),
            }
        } else {
            terminated = self.invoke_handler(msg);
        }

        let drained = self.queue.is_empty() || !self.queue.is_half_full();
        if terminated || drained {
            let to_notify: Vec<Name> = {
                let mut throttle = self.throttle.lock();
                throttle.notify_on_drain.drain().collect()
            };
            for peer in to_notify {
                send(Message::internal(self.name.clone(), peer, actions::XON));
            }
        }

        if terminated {
            self.terminated.store(true, Ordering::Release);
            self.unregister();
            StepOutcome::Terminated
        } else {
            StepOutcome::Continued
        }
    }

    fn invoke_handler(&self, msg: Message) -> bool {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.lock().on_message(msg)
        }));
        match result {
            Ok(Control::Continue) => false,
            Ok(Control::Stop) => {
                info!(worker = %self.name, "worker finished");
                true
            }
            Err(cause) => {
                let note = panic_note(&cause);
                warn!(worker = %self.name, "worker handler panicked: {note}");
                alarm::raise(Alarm::new(
                    "skal-worker-panic",
                    Severity::Error,
                    true,
                    false,
                    note,
                ));
                true
            }
        }
    }

    pub(crate) fn unregister(&self) {
        if REGISTRY.remove(&self.name).is_some() {
            let (count, condvar) = &*LIVE;
            let mut live = count.lock();
            *live = live.saturating_sub(1);
            condvar.notify_all();
        }
        debug!(worker = %self.name, "removed worker from the registry");
        if router::is_installed() {
            send(Message::internal(
                self.name.clone(),
                Name::resolve(domain::ROUTER_NAME),
                actions::DIED,
            ));
        }
    }

    /// Deliver a message into this worker's queue, applying back-pressure
    fn post(&self, msg: Message) {
        if self.queue.is_full() && !msg.is_internal() {
            if msg.flags().contains(MsgFlags::DROP_OK) {
                debug!(
                    worker = %self.name,
                    action = msg.action(),
                    "queue full, dropping droppable message"
                );
                if msg.flags().contains(MsgFlags::NTF_DROP) && !msg.sender().is_empty() {
                    let mut notice = Message::internal(
                        self.name.clone(),
                        msg.sender().clone(),
                        actions::ERROR_DROP,
                    );
                    notice.add_string("reason", "recipient queue full");
                    send(notice);
                }
                return;
            }
            if !msg.sender().is_empty() {
                let sender = msg.sender().clone();
                self.throttle.lock().notify_on_drain.insert(sender.clone());
                send(Message::internal(self.name.clone(), sender, actions::XOFF));
            }
        }
        self.queue.push(msg);
    }
}

/// Look up a live worker by name
pub fn lookup(name: &Name) -> Option<Arc<Worker>> {
    REGISTRY.get(name).map(|entry| Arc::clone(entry.value()))
}

fn panic_note(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Number of live workers in this process
pub(crate) fn live_count() -> usize {
    *LIVE.0.lock()
}

/// Block until every worker has terminated
pub(crate) fn wait_all_done() {
    let (count, condvar) = &*LIVE;
    let mut live = count.lock();
    while *live > 0 {
        condvar.wait(&mut live);
    }
}

/// Post `skal-terminate` to every live worker
pub(crate) fn terminate_all() {
    let originator = domain::me();
    let workers: Vec<Arc<Worker>> = REGISTRY
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    for worker in workers {
        worker.post(Message::internal(
            originator.clone(),
            worker.name().clone(),
            actions::TERMINATE,
        ));
    }
}

/// Send a message
///
/// The single delivery entry point: consumes the message, resolves the
/// recipient, attempts in-process delivery and falls back to the router
/// hook when the recipient is not local or is the router itself.
pub fn send(msg: Message) {
    if !msg.recipient().is_router() {
        if let Some(worker) = lookup(msg.recipient()) {
            worker.post(msg);
            return;
        }
    }
    router::outbound(msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Box<dyn Handler> {
        Box::new(|_msg: Message| Control::Continue)
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let config = WorkerConfig::new("dup-worker");
        let worker = Worker::create(config.clone(), noop_handler()).unwrap();
        assert!(matches!(
            Worker::create(config, noop_handler()),
            Err(SkalError::DuplicateName(_))
        ));
        worker.terminated.store(true, Ordering::Release);
        worker.unregister();
    }

    #[test]
    fn test_post_full_queue_sends_xoff_and_records_drain_notify() {
        let recipient =
            Worker::create(WorkerConfig::new("busy").queue_threshold(1), noop_handler()).unwrap();
        let sender =
            Worker::create(WorkerConfig::new("eager"), noop_handler()).unwrap();

        recipient.post(Message::new("busy", "work!").with_sender("eager"));
        assert!(!recipient.queue().is_empty());
        // Queue is now at threshold; the next post triggers throttling
        recipient.post(Message::new("busy", "work more!").with_sender("eager"));

        assert_eq!(recipient.queue().len(), 2);
        assert!(recipient
            .throttle
            .lock()
            .notify_on_drain
            .contains(sender.name()));

        // The xoff landed in the sender's internal lane
        let xoff = sender.queue().pop(true).unwrap();
        assert_eq!(xoff.action(), actions::XOFF);
        assert_eq!(xoff.sender(), recipient.name());

        for worker in [recipient, sender] {
            worker.terminated.store(true, Ordering::Release);
            worker.unregister();
        }
    }

    #[test]
    fn test_drop_ok_dropped_when_full() {
        let recipient =
            Worker::create(WorkerConfig::new("surly").queue_threshold(1), noop_handler()).unwrap();
        let sender = Worker::create(WorkerConfig::new("meek"), noop_handler()).unwrap();

        recipient.post(Message::new("surly", "work!").with_sender("meek"));
        recipient.post(
            Message::new("surly", "optional")
                .with_sender("meek")
                .with_flags(MsgFlags::DROP_OK | MsgFlags::NTF_DROP),
        );

        assert_eq!(recipient.queue().len(), 1);
        let notice = sender.queue().pop(true).unwrap();
        assert_eq!(notice.action(), actions::ERROR_DROP);
        assert_eq!(notice.get_string("reason").unwrap(), "recipient queue full");

        for worker in [recipient, sender] {
            worker.terminated.store(true, Ordering::Release);
            worker.unregister();
        }
    }

    #[test]
    fn test_process_step_handles_xoff_xon() {
        let worker = Worker::create(
            WorkerConfig::new("throttled").xoff_timeout(Duration::from_secs(60)),
            noop_handler(),
        )
        .unwrap();
        let peer = Name::resolve("peer");

        worker.queue().push(Message::internal(
            peer.clone(),
            worker.name().clone(),
            actions::XOFF,
        ));
        assert_eq!(worker.process_step(), StepOutcome::Continued);
        assert!(worker.is_blocked());

        // Blocked workers only pop internal messages
        worker.queue().push(Message::new("throttled", "work!"));
        assert!(!worker.is_ready());

        worker.queue().push(Message::internal(
            peer,
            worker.name().clone(),
            actions::XON,
        ));
        assert_eq!(worker.process_step(), StepOutcome::Continued);
        assert!(!worker.is_blocked());
        assert!(worker.is_ready());

        worker.terminated.store(true, Ordering::Release);
        worker.unregister();
    }

    #[test]
    fn test_xoff_timeout_clears_blocked_by() {
        let worker = Worker::create(
            WorkerConfig::new("impatient").xoff_timeout(Duration::from_millis(5)),
            noop_handler(),
        )
        .unwrap();

        worker.queue().push(Message::internal(
            Name::resolve("peer"),
            worker.name().clone(),
            actions::XOFF,
        ));
        worker.process_step();
        assert!(worker.is_blocked());

        std::thread::sleep(Duration::from_millis(10));
        assert!(!worker.is_blocked());

        // A regular message is popped again once the timeout lapsed
        worker.queue().push(Message::new("impatient", "work!"));
        assert!(worker.is_ready());
        worker.process_step();
        assert!(worker.queue().is_empty());

        worker.terminated.store(true, Ordering::Release);
        worker.unregister();
    }

    #[test]
    fn test_handler_stop_terminates() {
        let worker = Worker::create(
            WorkerConfig::new("quitter"),
            Box::new(|_msg: Message| Control::Stop),
        )
        .unwrap();
        worker.queue().push(Message::new("quitter", "last-job"));
        assert_eq!(worker.process_step(), StepOutcome::Terminated);
        assert!(lookup(&Name::resolve("quitter")).is_none());
    }

    #[test]
    fn test_handler_panic_terminates() {
        let worker = Worker::create(
            WorkerConfig::new("fragile"),
            Box::new(|_msg: Message| -> Control { panic!("boom") }),
        )
        .unwrap();
        worker.queue().push(Message::new("fragile", "work!"));
        assert_eq!(worker.process_step(), StepOutcome::Terminated);
        assert!(lookup(&Name::resolve("fragile")).is_none());
    }

    #[test]
    fn test_terminate_message_ends_worker() {
        let worker = Worker::create(WorkerConfig::new("retiree"), noop_handler()).unwrap();
        worker.queue().push(Message::internal(
            Name::resolve("skal-master"),
            worker.name().clone(),
            actions::TERMINATE,
        ));
        assert_eq!(worker.process_step(), StepOutcome::Terminated);
    }

    #[test]
    fn test_zero_ttl_still_delivered_locally() {
        // The ttl only guards router hops; local delivery ignores it
        let worker = Worker::create(WorkerConfig::new("ttl-target"), noop_handler()).unwrap();
        send(Message::new("ttl-target", "tick").with_ttl(0));
        assert_eq!(worker.queue().len(), 1);

        worker.terminated.store(true, Ordering::Release);
        worker.unregister();
    }

    #[test]
    fn test_running_flag_coalesces() {
        let worker = Worker::create(WorkerConfig::new("busy-flag"), noop_handler()).unwrap();
        assert!(worker.begin_run());
        assert!(!worker.begin_run());
        assert!(worker.finish_run()); // pending request surfaced
        assert!(!worker.finish_run());

        worker.terminated.store(true, Ordering::Release);
        worker.unregister();
    }
}
