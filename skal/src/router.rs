//! Router port
//!
//! The runtime talks to an out-of-process router daemon through a single
//! process-wide port. The port is explicitly installed by whatever owns
//! the transport (never constructed on first use), and explicitly torn
//! down, which drains pending sends first.
//!
//! Outbound: [`outbound`](crate::send) is invoked by `send` when a
//! recipient is not local, or is the router itself. Inbound: the
//! transport adapter calls [`deliver`] for every message the daemon
//! hands over; delivery is then the ordinary local path.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::actions;
use crate::error::Result;
use crate::msg::{Message, MsgFlags};

/// Outbound half of the link to the router daemon
///
/// Implementations serialize the message (see the `skal-codec` crate)
/// and put it on whatever transport reaches the daemon.
pub trait RouterHook: Send + Sync {
    /// Forward a message to the router daemon
    fn send(&self, msg: Message) -> Result<()>;

    /// Block until previously submitted messages have left the process
    fn flush(&self) {}
}

static ROUTER: Lazy<RwLock<Option<Arc<dyn RouterHook>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide router port
///
/// Replaces any previously installed hook.
pub fn install(hook: Arc<dyn RouterHook>) {
    *ROUTER.write() = Some(hook);
    debug!("router port installed");
}

/// Tear the router port down, draining pending sends
pub fn teardown() {
    let hook = ROUTER.write().take();
    if let Some(hook) = hook {
        hook.flush();
        debug!("router port torn down");
    }
}

/// Whether a router port is currently installed
pub fn is_installed() -> bool {
    ROUTER.read().is_some()
}

/// Inbound entry point for the transport adapter
///
/// The daemon delivered a message for a local worker; this is just
/// [`send`](crate::send) with an already-external sender.
pub fn deliver(msg: Message) {
    crate::worker::send(msg);
}

/// Hand a message to the router, or drop it when none is installed
pub(crate) fn outbound(msg: Message) {
    if msg.ttl() <= 0 {
        warn!(
            recipient = %msg.recipient(),
            action = msg.action(),
            "dropping message with expired ttl"
        );
        return;
    }
    let hook = ROUTER.read().clone();
    match hook {
        Some(hook) => {
            if let Err(err) = hook.send(msg) {
                warn!("router send failed: {err}");
            }
        }
        None => {
            debug!(
                recipient = %msg.recipient(),
                action = msg.action(),
                "no router installed, dropping non-local message"
            );
            if msg.flags().contains(MsgFlags::NTF_DROP) && !msg.sender().is_empty() {
                let sender = msg.sender().clone();
                let recipient = msg.recipient().clone();
                let mut notice = Message::internal(recipient, sender, actions::ERROR_DROP);
                notice.add_string("reason", "no recipient");
                notice.add_string("extra", format!("worker `{}` does not exist", msg.recipient()));
                crate::worker::send(notice);
            }
        }
    }
}
