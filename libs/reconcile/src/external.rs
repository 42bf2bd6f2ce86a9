//! The per-kind external client contract.
//!
//! Each resource kind implements [`ExternalClient`] once. The engine owns the
//! control flow around it (conditions, identity, branching), so
//! implementations only translate between the resource and the provider API.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::resource::Managed;

/// Fields found to differ between desired and observed state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drift(BTreeSet<String>);

impl Drift {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<String>) {
        self.0.insert(path.into());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Drift {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Result of one observe call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalObservation {
    pub exists: bool,
    pub up_to_date: bool,
    /// Observe filled unset desired-state fields from provider defaults.
    pub late_initialized: bool,
    /// External identity confirmed by this observation, if known.
    pub identity: Option<String>,
    /// Drifted fields; empty when up to date.
    pub drift: Drift,
}

impl ExternalObservation {
    /// The external object does not exist.
    pub fn absent() -> Self {
        Self::default()
    }

    /// The external object exists and matches the desired state.
    pub fn up_to_date() -> Self {
        Self {
            exists: true,
            up_to_date: true,
            ..Self::default()
        }
    }

    /// The external object exists; `drift` lists what differs. An empty
    /// drift means up to date.
    pub fn drifted(drift: Drift) -> Self {
        Self {
            exists: true,
            up_to_date: drift.is_empty(),
            drift,
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_late_init(mut self, late_initialized: bool) -> Self {
        self.late_initialized = late_initialized;
        self
    }
}

/// Result of a successful create call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalCreation {
    /// Identity assigned by the external system.
    pub identity: Option<String>,
}

impl ExternalCreation {
    pub fn with_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
        }
    }
}

/// Remote operations for resources of type `R`, bound to one account and
/// region by the connector.
///
/// Calls may mutate `cr` only in the documented places: `observe` writes the
/// observed state and may late-initialize unset desired fields.
#[async_trait]
pub trait ExternalClient<R: Managed>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn observe(&self, cr: &mut R) -> Result<ExternalObservation, Self::Error>;

    async fn create(&self, cr: &mut R) -> Result<ExternalCreation, Self::Error>;

    /// Apply only the fields listed in `drift`.
    async fn update(&self, cr: &mut R, drift: &Drift) -> Result<(), Self::Error>;

    async fn delete(&self, cr: &mut R) -> Result<(), Self::Error>;

    /// Whether `err` means the external object does not exist.
    fn is_not_found(&self, err: &Self::Error) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drifted_empty_is_up_to_date() {
        let obs = ExternalObservation::drifted(Drift::new());
        assert!(obs.exists && obs.up_to_date);

        let obs = ExternalObservation::drifted(["tags"].into_iter().collect());
        assert!(obs.exists && !obs.up_to_date);
        assert!(obs.drift.contains("tags"));
    }
}
