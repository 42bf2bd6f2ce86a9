//! Reconciliation error taxonomy.
//!
//! Every failure carries the phase it happened in. Two outcomes are
//! deliberately *not* errors: a provider "not found" during observe or delete
//! (the resource is absent) and an unresolved reference (the pass is
//! deferred, see [`crate::PassOutcome::Deferred`]).

use std::fmt;

use thiserror::Error;

/// Boxed error used for causes coming from collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The phase of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    Resolve,
    Observe,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Connect => "connect",
            Phase::Resolve => "resolve",
            Phase::Observe => "observe",
            Phase::Create => "create",
            Phase::Update => "update",
            Phase::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Flat classification of pass results, convenient for schedulers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    ProviderNotFound,
    CredentialSourceMissing,
    CredentialFetchFailed,
    ClientConstructionFailed,
    /// Not a failure. Only produced by [`crate::PassOutcome::kind`].
    ReferenceDeferred,
    ReferenceAmbiguous,
    ReferenceLookupFailed,
    ObserveFailed,
    CreateFailed,
    UpdateFailed,
    DeleteFailed,
    Cancelled,
}

/// Errors from the collaborator stores (provider configs, credentials,
/// resource lookups).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("store backend error: {0}")]
    Backend(#[source] BoxError),
}

impl StoreError {
    /// Returns true if the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// A failed reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The engine was handed a resource it does not manage, or the resource
    /// is missing required input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cannot get provider config {name}: {source}")]
    ProviderNotFound {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("provider config {provider} has neither ambient identity nor a credentials reference")]
    CredentialSourceMissing { provider: String },

    #[error("cannot get provider credentials {reference}: {source}")]
    CredentialFetchFailed {
        reference: String,
        #[source]
        source: StoreError,
    },

    #[error("cannot create client for provider {provider} in {region}: {source}")]
    ClientConstructionFailed {
        provider: String,
        region: String,
        #[source]
        source: BoxError,
    },

    #[error("reference for {field} matched {matches} {kind} resources")]
    ReferenceAmbiguous {
        field: String,
        kind: String,
        matches: usize,
    },

    #[error("cannot look up {kind} for {field}: {source}")]
    ReferenceLookupFailed {
        field: String,
        kind: String,
        #[source]
        source: StoreError,
    },

    #[error("cannot observe external resource: {0}")]
    ObserveFailed(#[source] BoxError),

    #[error("cannot create external resource: {0}")]
    CreateFailed(#[source] BoxError),

    #[error("cannot update external resource: {0}")]
    UpdateFailed(#[source] BoxError),

    #[error("cannot delete external resource: {0}")]
    DeleteFailed(#[source] BoxError),

    /// The pass was cancelled or ran out of time while a call was in flight.
    /// The true outcome of that call is unknown.
    #[error("pass cancelled during {phase}")]
    Cancelled { phase: Phase },
}

impl ReconcileError {
    /// The phase this error was raised in.
    pub fn phase(&self) -> Phase {
        match self {
            ReconcileError::InvalidInput(_)
            | ReconcileError::ProviderNotFound { .. }
            | ReconcileError::CredentialSourceMissing { .. }
            | ReconcileError::CredentialFetchFailed { .. }
            | ReconcileError::ClientConstructionFailed { .. } => Phase::Connect,
            ReconcileError::ReferenceAmbiguous { .. }
            | ReconcileError::ReferenceLookupFailed { .. } => Phase::Resolve,
            ReconcileError::ObserveFailed(_) => Phase::Observe,
            ReconcileError::CreateFailed(_) => Phase::Create,
            ReconcileError::UpdateFailed(_) => Phase::Update,
            ReconcileError::DeleteFailed(_) => Phase::Delete,
            ReconcileError::Cancelled { phase } => *phase,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::InvalidInput(_) => ErrorKind::InvalidInput,
            ReconcileError::ProviderNotFound { .. } => ErrorKind::ProviderNotFound,
            ReconcileError::CredentialSourceMissing { .. } => ErrorKind::CredentialSourceMissing,
            ReconcileError::CredentialFetchFailed { .. } => ErrorKind::CredentialFetchFailed,
            ReconcileError::ClientConstructionFailed { .. } => ErrorKind::ClientConstructionFailed,
            ReconcileError::ReferenceAmbiguous { .. } => ErrorKind::ReferenceAmbiguous,
            ReconcileError::ReferenceLookupFailed { .. } => ErrorKind::ReferenceLookupFailed,
            ReconcileError::ObserveFailed(_) => ErrorKind::ObserveFailed,
            ReconcileError::CreateFailed(_) => ErrorKind::CreateFailed,
            ReconcileError::UpdateFailed(_) => ErrorKind::UpdateFailed,
            ReconcileError::DeleteFailed(_) => ErrorKind::DeleteFailed,
            ReconcileError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns true if the pass was cancelled mid-call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReconcileError::Cancelled { .. })
    }

    /// Whether this failure is recorded on the resource as `Synced=False`.
    ///
    /// Connect failures, invalid input and cancellations leave status alone.
    pub fn marks_unsynced(&self) -> bool {
        !self.is_cancelled() && !matches!(self.phase(), Phase::Connect)
    }
}
