//! External-resource reconciliation.
//!
//! This library drives resources that live in an outside system (a cloud
//! provider API) toward their declared desired state. Key concepts:
//!
//! - **Managed resource**: a declarative record with desired-state
//!   parameters, observed state and status conditions ([`Resource`]).
//! - **Connector**: binds a resource to an authenticated client for its
//!   provider account and region ([`Connector`], [`ProviderConnector`]).
//! - **Reference resolution**: fills fields that name other resources
//!   ([`ReferenceResolver`]).
//! - **Reconciler**: one pass of connect, resolve, observe, then create,
//!   update or delete ([`Reconciler`]).
//!
//! # Invariants
//!
//! - A pass is idempotent: running it again against an unchanged external
//!   system performs no further mutation.
//! - At most one lifecycle condition (`Creating`, `Available`, `Deleting`)
//!   is current.
//! - The external identity, once recorded, is never reassigned.
//! - A deferred pass leaves the resource untouched.

mod condition;
mod connector;
mod context;
mod engine;
mod error;
mod external;
mod reference;
mod resource;

pub use condition::{Condition, ConditionReason, ConditionStatus, ConditionType, Conditions};
pub use connector::{
    CachingFactory, ClientFactory, ClientTarget, Connector, CredentialStore, Credentials,
    ProviderConfig, ProviderConfigStore, ProviderConnector, SecretKeySelector,
};
pub use context::PassContext;
pub use engine::{Action, PassOutcome, PassReport, Reconciler};
pub use error::{BoxError, ErrorKind, Phase, ReconcileError, StoreError};
pub use external::{Drift, ExternalClient, ExternalCreation, ExternalObservation};
pub use reference::{
    DeferReason, Reference, ReferenceField, ReferenceResolver, ReferenceSource, ResourceLookup,
    Resolution, SelectionPolicy, Target,
};
pub use resource::{
    late_init, Managed, ObjectMeta, Observation, Parameters, Resource, ResourceSpec,
    ResourceStatus,
};
