//! Per-pass context: identity, cancellation and deadline.

use std::future::{pending, Future};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use xrm_id::PassId;

use crate::error::{Phase, ReconcileError};

/// Context handed to every blocking call of one reconciliation pass.
///
/// The timeout budget belongs to the caller; the engine only honors it.
#[derive(Debug, Clone)]
pub struct PassContext {
    pass_id: PassId,
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl PassContext {
    /// A context with no cancellation signal and no deadline.
    pub fn new() -> Self {
        Self {
            pass_id: PassId::new(),
            cancel: None,
            deadline: None,
        }
    }

    /// Abort in-flight calls once `true` is sent on the channel.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn pass_id(&self) -> PassId {
        self.pass_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true if the pass has been cancelled or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        let signalled = self.cancel.as_ref().is_some_and(|rx| *rx.borrow());
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        signalled || expired
    }

    /// Run one blocking call of `phase`, racing it against cancellation and
    /// the deadline.
    ///
    /// A call that loses the race is dropped and reported as
    /// [`ReconcileError::Cancelled`].
    pub async fn run<F>(&self, phase: Phase, call: F) -> Result<F::Output, ReconcileError>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return Err(ReconcileError::Cancelled { phase });
        }

        let mut cancel = self.cancel.clone();
        let cancelled = async move {
            let Some(rx) = cancel.as_mut() else {
                return pending::<()>().await;
            };
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                // A dropped sender can never cancel us.
                if rx.changed().await.is_err() {
                    return pending::<()>().await;
                }
            }
        };

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            out = call => Ok(out),
            _ = cancelled => Err(ReconcileError::Cancelled { phase }),
            _ = expired => Err(ReconcileError::Cancelled { phase }),
        }
    }
}

impl Default for PassContext {
    fn default() -> Self {
        Self::new()
    }
}
