//! Cooperative back-pressure between a fast producer and a slow consumer

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use skal::domain::Name;
use skal::{actions, Control, Executor, ExecutorConfig, Message, Parameters, WorkerConfig};

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn full_queue_throttles_sender_until_drained() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    skal::init(Parameters::default()).unwrap();
    let executor = Executor::new(ExecutorConfig::default());
    let (tx, rx) = mpsc::channel();

    // Deliberately slow consumer with a tiny queue
    executor
        .add_worker(
            WorkerConfig::new("emp").queue_threshold(1),
            move |msg: Message| {
                if msg.action() == actions::INIT {
                    thread::sleep(Duration::from_millis(10));
                } else {
                    tx.send(msg.action().to_string()).unwrap();
                }
                Control::Continue
            },
        )
        .unwrap();

    // The long xoff timeout ensures that only a real skal-xon can
    // unblock the producer within this test
    executor
        .add_worker(
            WorkerConfig::new("boss").xoff_timeout(Duration::from_secs(60)),
            |msg: Message| {
                if msg.action() == actions::INIT {
                    skal::send(Message::new("emp", "work!"));
                    skal::send(Message::new("emp", "work more!"));
                }
                Control::Continue
            },
        )
        .unwrap();

    let boss = || skal::worker::lookup(&Name::resolve("boss")).expect("boss is alive");

    // The second send hit a full queue, so emp told boss to back off
    assert!(
        wait_until(Duration::from_secs(5), || boss().is_blocked()),
        "boss never received skal-xoff"
    );

    // Both messages still get through; the queue is unbounded
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "work!");
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "work more!");

    // Once emp drained to empty, boss received skal-xon
    assert!(
        wait_until(Duration::from_secs(5), || !boss().is_blocked()),
        "boss never received skal-xon"
    );

    skal::terminate();
    skal::wait();
}
