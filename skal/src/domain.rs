//! Names, domains and caller identity
//!
//! Every worker and group is identified by a full name `local@domain`. The
//! domain is a process-wide setting fixed at [`init`](crate::init) time;
//! free-form names without a domain part are resolved against it.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Domain literal meaning "not connected to a router"
pub const STANDALONE_DOMAIN: &str = "skal-standalone";

/// Local name of the router daemon
///
/// Any recipient whose local part is `skald` or begins with `skald` is
/// routed externally and never delivered in-process.
pub const ROUTER_NAME: &str = "skald";

static DOMAIN: Lazy<RwLock<String>> = Lazy::new(|| RwLock::new(STANDALONE_DOMAIN.to_string()));

/// Fully qualified name of a worker or group: `local@domain`
///
/// Two names compare equal iff both parts match byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    local: String,
    domain: String,
}

impl Name {
    /// Resolve a free-form name into a full name
    ///
    /// If `input` contains the `@` separator it is split there; otherwise
    /// the current process domain is appended. An empty input yields the
    /// empty name (see [`Name::is_empty`]).
    pub fn resolve(input: &str) -> Self {
        if input.is_empty() {
            return Self {
                local: String::new(),
                domain: String::new(),
            };
        }
        match input.split_once('@') {
            Some((local, domain)) => Self {
                local: local.to_string(),
                domain: domain.to_string(),
            },
            None => Self {
                local: input.to_string(),
                domain: domain(),
            },
        }
    }

    /// Local part of the name
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Domain part of the name
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// An empty name labels a message whose sender is unknown
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Whether this name addresses the router daemon
    pub fn is_router(&self) -> bool {
        self.local.starts_with(ROUTER_NAME)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            Ok(())
        } else {
            write!(f, "{}@{}", self.local, self.domain)
        }
    }
}

impl From<&str> for Name {
    fn from(input: &str) -> Self {
        Name::resolve(input)
    }
}

/// Get the domain this process belongs to
pub fn domain() -> String {
    DOMAIN.read().clone()
}

/// Set the domain this process belongs to
///
/// Called once by [`init`](crate::init), before any worker exists.
pub(crate) fn set_domain(domain: impl Into<String>) {
    *DOMAIN.write() = domain.into();
}

/// Whether this process runs without a router
pub fn is_standalone() -> bool {
    DOMAIN.read().as_str() == STANDALONE_DOMAIN
}

static EXTERNAL_SEQ: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Name>> = const { RefCell::new(None) };

    /// Stable per-thread identity used to label senders outside any worker.
    static EXTERNAL_IDENT: String =
        format!("skal-external-{}", EXTERNAL_SEQ.fetch_add(1, Ordering::Relaxed));
}

/// Identity of the calling thread
///
/// Inside a handler invocation this is the worker's full name; anywhere
/// else it is a stable per-thread `skal-external-<n>` identifier.
pub fn me() -> Name {
    match current_worker() {
        Some(name) => name,
        None => EXTERNAL_IDENT.with(|ident| Name::resolve(ident)),
    }
}

/// The worker the calling thread is running, if any.
pub(crate) fn current_worker() -> Option<Name> {
    CURRENT_WORKER.with(|w| w.borrow().clone())
}

/// Marks the calling thread as running the given worker until dropped.
pub(crate) struct WorkerScope;

impl WorkerScope {
    pub(crate) fn enter(name: Name) -> Self {
        CURRENT_WORKER.with(|w| *w.borrow_mut() = Some(name));
        WorkerScope
    }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|w| *w.borrow_mut() = None);
    }
}
