//! Skal worker runtime
//!
//! In-process actor runtime: named cooperative workers that communicate
//! exclusively by message passing, multiplexed over bounded thread pools
//! by executors with pluggable scheduling policies. An optional
//! out-of-process router daemon ("skald") extends delivery across
//! processes and hosts; this crate only speaks to it through a pluggable
//! port (see [`router`]) and the `skal-codec` wire encoding.
//!
//! # Architecture
//!
//! ```text
//! Producer ── send() ─┬─ worker registry ──┬─ Worker A queue ─┐
//!                     │    (in-process)    └─ Worker B queue ─┤
//!                     │                                       │ semaphore
//!                     └─ router port ── skald ── other hosts  │
//!                                                             ▼
//!                                 Executor: dispatcher ── scheduler
//!                                      │ one-shot "process one message"
//!                                      ▼
//!                                 worker-pool threads
//! ```
//!
//! Workers never own a thread. When a message lands in a worker's queue,
//! the owning executor's dispatcher is woken, asks its scheduler for the
//! next ready worker, and hands it to the pool for a single-message
//! processing step. Back-pressure is cooperative: a worker whose queue
//! fills past its threshold sends `skal-xoff` to the offending sender
//! and `skal-xon` once it drains.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use skal::{Control, Executor, ExecutorConfig, Message, Parameters, WorkerConfig};
//!
//! fn main() -> skal::Result<()> {
//!     skal::init(Parameters::default())?;
//!     let executor = Executor::new(ExecutorConfig::default());
//!
//!     executor.add_worker(WorkerConfig::new("greeter"), |msg: Message| {
//!         if msg.action() == "hello" {
//!             println!("hello, {}", msg.sender());
//!         }
//!         Control::Continue
//!     })?;
//!
//!     skal::send(Message::new("greeter", "hello"));
//!     skal::terminate();
//!     skal::wait();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod actions;
pub mod alarm;
pub mod blob;
pub mod domain;
pub mod error;
pub mod executor;
pub mod global;
pub mod group;
pub mod msg;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod worker;

// Re-export the everyday surface
pub use alarm::{Alarm, Severity};
pub use blob::{create_blob, open_blob, register_allocator, Allocator, AllocatorScope, BlobProxy};
pub use domain::{me, Name};
pub use error::{Result, SkalError};
pub use executor::{spawn_worker, Executor, ExecutorConfig, ExecutorHandle};
pub use global::{init, parameters, terminate, wait, Parameters};
pub use msg::{IFlags, Message, MsgFlags, DEFAULT_TTL};
pub use queue::MsgQueue;
pub use router::{deliver, RouterHook};
pub use scheduler::{Policy, Scheduler};
pub use worker::{send, Control, Handler, Worker, WorkerConfig};
