//! Framework-reserved message actions
//!
//! All reserved actions begin with [`RESERVED_PREFIX`]. Handlers receive
//! some of them (notably [`INIT`]); the rest are consumed by the runtime
//! or exchanged with the router daemon.

/// Prefix reserved for framework actions; user actions must not start
/// with it.
pub const RESERVED_PREFIX: &str = "skal-";

/// First tick after worker creation, delivered to every handler
pub const INIT: &str = "skal-init";

/// Please exit after this tick
pub const TERMINATE: &str = "skal-terminate";

/// Stop sending non-internal traffic to me
pub const XOFF: &str = "skal-xoff";

/// You may resume sending
pub const XON: &str = "skal-xon";

/// Your `DROP_OK` message was dropped
pub const ERROR_DROP: &str = "skal-error-drop";

/// Worker started (to the router)
pub const BORN: &str = "skal-born";

/// Worker ended (to the router)
pub const DIED: &str = "skal-died";

/// Group created (to the router)
pub const CREATE_GROUP: &str = "skal-create-group";

/// Group destroyed (to the router)
pub const DESTROY_GROUP: &str = "skal-destroy-group";

/// Subscription added (to the router)
pub const SUBSCRIBE: &str = "skal-subscribe";

/// Subscription removed (to the router)
pub const UNSUBSCRIBE: &str = "skal-unsubscribe";

/// Alarm report (to the router)
pub const ALARM: &str = "skal-alarm";

/// Whether an action string is reserved for the framework
pub fn is_reserved(action: &str) -> bool {
    action.starts_with(RESERVED_PREFIX)
}
