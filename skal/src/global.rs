//! Process-level lifecycle: init, wait, terminate
//!
//! [`init`] fixes the process domain and records how to reach the router
//! daemon; it is idempotent and must run before workers are created.
//! [`terminate`] asks every live worker to exit; [`wait`] blocks until
//! they all have.

use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::domain;
use crate::error::{Result, SkalError};
use crate::worker;

/// Default URL to reach the router daemon
pub const DEFAULT_ROUTER_URL: &str = "unix:///tmp/skald.sock";

/// Runtime initialization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    /// Run without a router; router-bound traffic is dropped
    pub standalone: bool,
    /// URL of the router daemon; empty selects [`DEFAULT_ROUTER_URL`].
    /// Ignored when `standalone` is set.
    pub router_url: String,
    /// Domain this process belongs to; empty keeps the current one
    pub domain: String,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            standalone: true,
            router_url: String::new(),
            domain: String::new(),
        }
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static PARAMETERS: Lazy<RwLock<Option<Parameters>>> = Lazy::new(|| RwLock::new(None));

/// Initialize the runtime; idempotent
///
/// Validates the router URL, fixes the process domain and records the
/// parameters for the transport adapter to pick up. Calling it again is
/// a no-op.
pub fn init(params: Parameters) -> Result<()> {
    let mut params = params;
    if !params.standalone {
        if params.router_url.is_empty() {
            params.router_url = DEFAULT_ROUTER_URL.to_string();
        }
        Url::parse(&params.router_url)
            .map_err(|err| SkalError::bad_url(&params.router_url, err))?;
    }

    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    if !params.domain.is_empty() {
        domain::set_domain(&params.domain);
    }
    info!(
        standalone = params.standalone,
        domain = %domain::domain(),
        "skal initialized"
    );
    *PARAMETERS.write() = Some(params);
    Ok(())
}

/// The parameters recorded by [`init`], if it ran
pub fn parameters() -> Option<Parameters> {
    PARAMETERS.read().clone()
}

/// Block the caller until all workers have terminated
pub fn wait() {
    worker::wait_all_done();
}

/// Post `skal-terminate` to every live worker
///
/// Returns immediately; pair with [`wait`] for an orderly shutdown.
pub fn terminate() {
    info!(live = worker::live_count(), "terminating all workers");
    worker::terminate_all();
}
