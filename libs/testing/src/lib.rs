//! Test support for reconcilers.
//!
//! In-memory implementations of the collaborator stores the engine talks to,
//! each recording how often it was called and able to simulate an outage.

mod lookup;
mod stores;

use std::time::Duration;

use tokio::sync::watch;
use xrm_reconcile::PassContext;

pub use lookup::MemoryLookup;
pub use stores::{MemoryCredentialStore, MemoryProviderStore};

/// Default deadline for test passes. Generous so only hung calls trip it.
pub const TEST_PASS_TIMEOUT: Duration = Duration::from_secs(5);

/// A pass context with the default test deadline.
pub fn pass_context() -> PassContext {
    PassContext::new().with_timeout(TEST_PASS_TIMEOUT)
}

/// A pass context that is cancelled by sending `true` on the returned sender.
pub fn cancellable_pass_context() -> (watch::Sender<bool>, PassContext) {
    let (tx, rx) = watch::channel(false);
    (tx, PassContext::new().with_cancel(rx))
}

/// Initialize test logging (safe to call from every test).
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn,xrm=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
