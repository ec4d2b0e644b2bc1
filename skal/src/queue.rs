//! Per-worker priority message queue
//!
//! Three FIFO lanes: internal, urgent, regular. Pop drains internal
//! messages first; unless an internal-only pop was requested, urgent
//! messages then go before regular ones. Pushing never blocks and never
//! fails: the queue is unbounded past its threshold, which only drives
//! the back-pressure protocol.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::msg::{Message, MsgFlags};

type Notifier = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Lanes {
    internal: VecDeque<Message>,
    urgent: VecDeque<Message>,
    regular: VecDeque<Message>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.internal.len() + self.urgent.len() + self.regular.len()
    }
}

/// Three-lane message queue with a back-pressure threshold
pub struct MsgQueue {
    lanes: Mutex<Lanes>,
    threshold: usize,
    notifier: Mutex<Option<Notifier>>,
}

impl MsgQueue {
    /// Create a queue; `threshold` must be > 0
    pub fn new(threshold: usize) -> Self {
        assert!(threshold > 0, "queue threshold must be > 0");
        Self {
            lanes: Mutex::new(Lanes::default()),
            threshold,
            notifier: Mutex::new(None),
        }
    }

    /// Install the callback fired after every successful push
    ///
    /// The executor owning this queue's worker uses it to post its
    /// dispatch semaphore.
    pub fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Push a message; never blocks, never fails
    pub fn push(&self, msg: Message) {
        {
            let mut lanes = self.lanes.lock();
            if msg.is_internal() {
                lanes.internal.push_back(msg);
            } else if msg.flags().contains(MsgFlags::URGENT) {
                lanes.urgent.push_back(msg);
            } else {
                lanes.regular.push_back(msg);
            }
        }
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier();
        }
    }

    /// Pop the next message, if any
    ///
    /// With `internal_only`, urgent and regular messages are left alone
    /// even when present.
    pub fn pop(&self, internal_only: bool) -> Option<Message> {
        let mut lanes = self.lanes.lock();
        if let Some(msg) = lanes.internal.pop_front() {
            return Some(msg);
        }
        if internal_only {
            return None;
        }
        lanes
            .urgent
            .pop_front()
            .or_else(|| lanes.regular.pop_front())
    }

    /// Total number of queued messages
    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Number of queued internal messages
    pub fn internal_len(&self) -> usize {
        self.lanes.lock().internal.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the back-pressure threshold has been reached
    pub fn is_full(&self) -> bool {
        self.len() >= self.threshold
    }

    /// Whether the queue holds at least half its threshold
    pub fn is_half_full(&self) -> bool {
        self.len() >= self.threshold / 2
    }

    /// The back-pressure threshold
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Name;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn regular(action: &str) -> Message {
        Message::new("q@test", action)
    }

    fn urgent(action: &str) -> Message {
        Message::new("q@test", action).with_flags(MsgFlags::URGENT)
    }

    fn internal(action: &str) -> Message {
        Message::internal(Name::resolve("x@test"), Name::resolve("q@test"), action)
    }

    #[test]
    fn test_pop_order_across_lanes() {
        let queue = MsgQueue::new(10);
        queue.push(regular("r1"));
        queue.push(urgent("u1"));
        queue.push(internal("i1"));
        queue.push(regular("r2"));
        queue.push(urgent("u2"));
        queue.push(internal("i2"));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop(false))
            .map(|m| m.action().to_string())
            .collect();
        assert_eq!(order, ["i1", "i2", "u1", "u2", "r1", "r2"]);
    }

    #[test]
    fn test_internal_only_pop() {
        let queue = MsgQueue::new(10);
        queue.push(regular("r1"));
        queue.push(internal("i1"));

        assert_eq!(queue.pop(true).unwrap().action(), "i1");
        assert!(queue.pop(true).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(false).unwrap().action(), "r1");
    }

    #[test]
    fn test_each_message_popped_exactly_once() {
        let queue = MsgQueue::new(3);
        for i in 0..100 {
            let mut msg = regular("tick");
            msg.add_int("seq", i);
            queue.push(msg);
        }
        let mut seen = Vec::new();
        while let Some(msg) = queue.pop(false) {
            seen.push(msg.get_int("seq").unwrap());
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_threshold_predicates() {
        let queue = MsgQueue::new(4);
        assert!(!queue.is_full());
        queue.push(regular("a"));
        queue.push(regular("b"));
        assert!(queue.is_half_full());
        assert!(!queue.is_full());
        queue.push(regular("c"));
        queue.push(regular("d"));
        assert!(queue.is_full());
        // The threshold does not cap capacity
        queue.push(regular("e"));
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_threshold_one_still_works() {
        let queue = MsgQueue::new(1);
        assert!(queue.is_half_full()); // vacuously, 0 >= 0
        queue.push(regular("a"));
        assert!(queue.is_full());
        assert_eq!(queue.pop(false).unwrap().action(), "a");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_notifier_fires_on_every_push() {
        let queue = MsgQueue::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        queue.set_notifier(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        queue.push(regular("a"));
        queue.push(urgent("b"));
        queue.push(internal("c"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
