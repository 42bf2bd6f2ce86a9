//! Provider API plumbing shared by every kind.
//!
//! Each kind defines an API trait (the remote boundary) and ships an
//! in-memory fake of it. The fakes share error reporting, fault injection
//! and the client factory defined here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;
use xrm_reconcile::{BoxError, ClientTarget, Credentials};

/// Error returned by a provider API call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl ApiError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ApiError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Call log and injected failures of a fake API, keyed by operation name.
#[derive(Debug, Default)]
pub(crate) struct Faults {
    failures: Mutex<HashMap<&'static str, ApiError>>,
    calls: Mutex<Vec<&'static str>>,
}

impl Faults {
    /// Fail every call of `op` with `err` until healed.
    pub(crate) fn inject(&self, op: &'static str, err: ApiError) {
        lock(&self.failures).insert(op, err);
    }

    pub(crate) fn heal(&self, op: &'static str) {
        lock(&self.failures).remove(op);
    }

    /// Record a call of `op`, failing if a fault is injected for it.
    pub(crate) fn call(&self, op: &'static str) -> Result<(), ApiError> {
        lock(&self.calls).push(op);
        match lock(&self.failures).get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        lock(&self.calls).iter().filter(|c| **c == op).count()
    }
}

/// Client factory handing out clients over one shared API handle.
///
/// The handle stands in for a per-account SDK client; the factory checks the
/// credentials it is given and records each construction.
#[derive(Debug)]
pub struct ApiFactory<A> {
    api: A,
    builds: AtomicUsize,
}

impl<A: Clone> ApiFactory<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Number of clients built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub(crate) fn connect(
        &self,
        target: &ClientTarget,
        credentials: &Credentials,
    ) -> Result<A, BoxError> {
        if target.region.is_empty() {
            return Err(format!("provider {} has no region", target.provider).into());
        }
        if let Credentials::Secret(bytes) = credentials {
            if bytes.is_empty() {
                return Err("credential secret is empty".into());
            }
        }

        self.builds.fetch_add(1, Ordering::SeqCst);
        debug!(
            provider = %target.provider,
            region = %target.region,
            "Connected to provider API"
        );
        Ok(self.api.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(region: &str) -> ClientTarget {
        ClientTarget {
            provider: "aws".into(),
            region: region.into(),
            endpoint: None,
        }
    }

    #[test]
    fn test_faults_persist_until_healed() {
        let faults = Faults::default();
        faults.inject("attach", ApiError::Request("throttled".into()));

        assert!(faults.call("attach").is_err());
        assert!(faults.call("attach").is_err());
        assert!(faults.call("detach").is_ok());

        faults.heal("attach");
        assert!(faults.call("attach").is_ok());
        assert_eq!(faults.count("attach"), 3);
        assert_eq!(faults.calls().len(), 4);
    }

    #[test]
    fn test_factory_rejects_bad_input() {
        let factory = ApiFactory::new(());

        assert!(factory.connect(&target(""), &Credentials::Ambient).is_err());
        assert!(factory
            .connect(&target("us-east-1"), &Credentials::Secret(Vec::new()))
            .is_err());
        assert!(factory
            .connect(&target("us-east-1"), &Credentials::Secret(b"k".to_vec()))
            .is_ok());
        assert_eq!(factory.builds(), 1);
    }
}
