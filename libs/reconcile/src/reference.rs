//! Cross-resource reference resolution.
//!
//! A desired-state field may name another resource instead of carrying a
//! literal value. Each such field is described by a [`ReferenceField`] and
//! resolved by the single routine in [`ReferenceResolver`]:
//!
//! - a concrete value always wins over a reference;
//! - a direct reference reads the named resource's external identity (or an
//!   observed attribute);
//! - a selector must match exactly one resource.
//!
//! A dependency that is not ready yet defers the pass. Deferral is not an
//! error and leaves the resource untouched.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::PassContext;
use crate::error::{Phase, ReconcileError, StoreError};
use crate::resource::Managed;

/// How a field points at another resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reference {
    #[default]
    None,
    /// Resolve from the resource with this name.
    Direct { name: String },
    /// Resolve from the single resource carrying all of these labels.
    #[serde(rename_all = "camelCase")]
    Selector { match_labels: BTreeMap<String, String> },
}

impl Reference {
    pub fn direct(name: impl Into<String>) -> Self {
        Reference::Direct { name: name.into() }
    }

    pub fn selector<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Reference::Selector {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Reference::None)
    }
}

/// What to read from the referenced resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSource {
    ExternalName,
    Attribute(&'static str),
}

/// One reference-backed desired-state field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceField {
    /// Field path, e.g. `vpcId` or `routes[0].gatewayId`.
    pub path: String,
    pub current: Option<String>,
    pub reference: Reference,
    pub target_kind: &'static str,
    pub source: ReferenceSource,
}

impl ReferenceField {
    /// A field filled from the target's external identity.
    pub fn external_name(
        path: impl Into<String>,
        current: Option<&str>,
        reference: &Reference,
        target_kind: &'static str,
    ) -> Self {
        Self {
            path: path.into(),
            current: current.map(str::to_string),
            reference: reference.clone(),
            target_kind,
            source: ReferenceSource::ExternalName,
        }
    }

    pub fn from_attribute(mut self, key: &'static str) -> Self {
        self.source = ReferenceSource::Attribute(key);
        self
    }

    fn has_value(&self) -> bool {
        self.current.as_deref().is_some_and(|v| !v.is_empty())
    }
}

/// Read-only snapshot of a resource that can be referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub external_name: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Target {
    pub fn of(resource: &dyn Managed) -> Self {
        let meta = resource.meta();
        Self {
            kind: resource.kind().to_string(),
            name: meta.name.clone(),
            labels: meta.labels.clone(),
            external_name: meta.external_name.clone(),
            attributes: resource.attributes(),
        }
    }

    fn read(&self, source: ReferenceSource) -> Option<String> {
        match source {
            ReferenceSource::ExternalName => self.external_name.clone(),
            ReferenceSource::Attribute(key) => self.attributes.get(key).cloned(),
        }
    }
}

/// Fetches referenced resources.
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    /// Fetch one resource by kind and name. `Ok(None)` if it does not exist.
    async fn get(&self, kind: &str, name: &str) -> Result<Option<Target>, StoreError>;

    /// List resources of `kind` carrying every label in `labels`.
    async fn list(
        &self,
        kind: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Target>, StoreError>;
}

/// What to do when a selector matches more than one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// Defer and wait for the ambiguity to clear.
    #[default]
    Lenient,
    /// Fail with [`ReconcileError::ReferenceAmbiguous`].
    Deterministic,
}

/// Why a reference could not be resolved yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    TargetMissing { kind: String, name: String },
    TargetNotReady { kind: String, name: String },
    NoMatch { kind: String },
    MultipleMatches { kind: String, matches: usize },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::TargetMissing { kind, name } => write!(f, "{kind} {name} does not exist"),
            DeferReason::TargetNotReady { kind, name } => {
                write!(f, "{kind} {name} has no value to reference yet")
            }
            DeferReason::NoMatch { kind } => write!(f, "no {kind} matches the selector"),
            DeferReason::MultipleMatches { kind, matches } => {
                write!(f, "{matches} {kind} resources match the selector")
            }
        }
    }
}

/// Result of resolving all references of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// All mandatory references resolved; `applied` fields were written.
    Resolved { applied: usize },
    /// A dependency is not ready; nothing was written.
    Deferred { field: String, reason: DeferReason },
}

enum FieldResolution {
    Value(String),
    Skip,
    Defer(DeferReason),
}

/// Resolves every [`ReferenceField`] of a resource.
pub struct ReferenceResolver<L> {
    lookup: L,
    policy: SelectionPolicy,
}

impl<L: ResourceLookup> ReferenceResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self {
            lookup,
            policy: SelectionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Resolve references and write the values into `resource`.
    ///
    /// Values are written only once every field resolved, so a deferral or
    /// failure leaves the resource unchanged.
    pub async fn resolve(
        &self,
        ctx: &PassContext,
        resource: &mut dyn Managed,
    ) -> Result<Resolution, ReconcileError> {
        let mut resolved = Vec::new();

        for field in resource.reference_fields() {
            if field.has_value() {
                continue;
            }
            match self.resolve_field(ctx, &field).await? {
                FieldResolution::Value(value) => resolved.push((field.path, value)),
                FieldResolution::Skip => {}
                FieldResolution::Defer(reason) => {
                    debug!(field = %field.path, %reason, "Reference not ready, deferring");
                    return Ok(Resolution::Deferred {
                        field: field.path,
                        reason,
                    });
                }
            }
        }

        let applied = resolved.len();
        for (path, value) in resolved {
            resource.apply_reference(&path, value)?;
        }
        Ok(Resolution::Resolved { applied })
    }

    async fn resolve_field(
        &self,
        ctx: &PassContext,
        field: &ReferenceField,
    ) -> Result<FieldResolution, ReconcileError> {
        let kind = field.target_kind;
        let lookup_failed = |source| ReconcileError::ReferenceLookupFailed {
            field: field.path.clone(),
            kind: kind.to_string(),
            source,
        };

        let target = match &field.reference {
            Reference::None => return Ok(FieldResolution::Skip),
            Reference::Direct { name } => {
                let found = ctx
                    .run(Phase::Resolve, self.lookup.get(kind, name))
                    .await?
                    .map_err(lookup_failed)?;
                match found {
                    Some(target) => target,
                    None => {
                        return Ok(FieldResolution::Defer(DeferReason::TargetMissing {
                            kind: kind.to_string(),
                            name: name.clone(),
                        }))
                    }
                }
            }
            Reference::Selector { match_labels } => {
                let mut matches = ctx
                    .run(Phase::Resolve, self.lookup.list(kind, match_labels))
                    .await?
                    .map_err(lookup_failed)?;
                match matches.len() {
                    0 => {
                        return Ok(FieldResolution::Defer(DeferReason::NoMatch {
                            kind: kind.to_string(),
                        }))
                    }
                    1 => matches.remove(0),
                    n => {
                        return match self.policy {
                            SelectionPolicy::Lenient => {
                                Ok(FieldResolution::Defer(DeferReason::MultipleMatches {
                                    kind: kind.to_string(),
                                    matches: n,
                                }))
                            }
                            SelectionPolicy::Deterministic => {
                                Err(ReconcileError::ReferenceAmbiguous {
                                    field: field.path.clone(),
                                    kind: kind.to_string(),
                                    matches: n,
                                })
                            }
                        }
                    }
                }
            }
        };

        Ok(match target.read(field.source) {
            Some(value) if !value.is_empty() => FieldResolution::Value(value),
            _ => FieldResolution::Defer(DeferReason::TargetNotReady {
                kind: target.kind,
                name: target.name,
            }),
        })
    }
}
