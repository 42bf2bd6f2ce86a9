//! The managed resource model.
//!
//! A [`Resource`] bundles identity metadata, the desired state
//! (`spec.for_provider`), and the status written by the engine: conditions and
//! the observed state (`status.at_provider`). Kinds only supply the
//! parameter and observation types; the [`Managed`] plumbing is shared.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use xrm_id::ResourceUid;

use crate::condition::Conditions;
use crate::error::ReconcileError;
use crate::reference::ReferenceField;

/// Identity and lifecycle metadata of a resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Stable, owner-chosen name.
    pub name: String,

    #[serde(default)]
    pub uid: ResourceUid,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Identifier of the external object (e.g. an ARN). Set once, never
    /// reassigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,

    /// Set by the owner to request deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_requested_at: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: ResourceUid::new(),
            labels: BTreeMap::new(),
            external_name: None,
            deletion_requested_at: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_deletion_requested(&self) -> bool {
        self.deletion_requested_at.is_some()
    }

    pub fn request_deletion(&mut self) {
        if self.deletion_requested_at.is_none() {
            self.deletion_requested_at = Some(Utc::now());
        }
    }

    /// Returns true if every selector label is present with the same value.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }
}

/// Desired-state parameters of one resource kind.
pub trait Parameters:
    Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Kind name, used for reference lookups and diagnostics.
    const KIND: &'static str;

    /// Fields that may be filled from another resource.
    fn reference_fields(&self) -> Vec<ReferenceField> {
        Vec::new()
    }

    /// Write a resolved reference value into the field at `path`.
    ///
    /// Returns false if `path` names no reference-backed field.
    fn apply_reference(&mut self, _path: &str, _value: String) -> bool {
        false
    }
}

/// Observed state of one resource kind.
pub trait Observation:
    Debug + Clone + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Attributes other resources may reference.
    fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl Observation for () {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec<P> {
    /// Name of the provider config holding region and credentials.
    pub provider_config_ref: String,
    pub for_provider: P,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(
    rename_all = "camelCase",
    bound(deserialize = "O: Deserialize<'de> + Default")
)]
pub struct ResourceStatus<O> {
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub at_provider: O,
}

/// A managed resource instance of one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "P: Deserialize<'de>, O: Deserialize<'de> + Default"))]
pub struct Resource<P, O> {
    pub metadata: ObjectMeta,
    pub spec: ResourceSpec<P>,
    #[serde(default)]
    pub status: ResourceStatus<O>,
}

impl<P, O> Resource<P, O>
where
    P: Parameters,
    O: Observation,
{
    pub fn new(name: impl Into<String>, provider_config_ref: impl Into<String>, params: P) -> Self {
        Self {
            metadata: ObjectMeta::new(name),
            spec: ResourceSpec {
                provider_config_ref: provider_config_ref.into(),
                for_provider: params,
            },
            status: ResourceStatus::default(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata = self.metadata.with_label(key, value);
        self
    }

    pub fn params(&self) -> &P {
        &self.spec.for_provider
    }

    pub fn params_mut(&mut self) -> &mut P {
        &mut self.spec.for_provider
    }

    pub fn observation(&self) -> &O {
        &self.status.at_provider
    }

    /// Replace the observed state wholesale.
    pub fn set_observation(&mut self, observation: O) {
        self.status.at_provider = observation;
    }
}

/// Object-safe view of any managed resource.
///
/// Schedulers and stores hold resources as `Box<dyn Managed>`; the engine
/// recovers the concrete type with [`Managed::as_any_mut`].
pub trait Managed: Any + Debug + Send + Sync {
    fn kind(&self) -> &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn provider_config_ref(&self) -> &str;

    fn conditions(&self) -> &Conditions;

    fn conditions_mut(&mut self) -> &mut Conditions;

    fn reference_fields(&self) -> Vec<ReferenceField>;

    fn apply_reference(&mut self, path: &str, value: String) -> Result<(), ReconcileError>;

    /// Observed attributes exposed to referencing resources.
    fn attributes(&self) -> BTreeMap<String, String>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<P, O> Managed for Resource<P, O>
where
    P: Parameters,
    O: Observation,
{
    fn kind(&self) -> &'static str {
        P::KIND
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn provider_config_ref(&self) -> &str {
        &self.spec.provider_config_ref
    }

    fn conditions(&self) -> &Conditions {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Conditions {
        &mut self.status.conditions
    }

    fn reference_fields(&self) -> Vec<ReferenceField> {
        self.spec.for_provider.reference_fields()
    }

    fn apply_reference(&mut self, path: &str, value: String) -> Result<(), ReconcileError> {
        if self.spec.for_provider.apply_reference(path, value) {
            Ok(())
        } else {
            Err(ReconcileError::InvalidInput(format!(
                "{} has no reference field {path}",
                P::KIND
            )))
        }
    }

    fn attributes(&self) -> BTreeMap<String, String> {
        self.status.at_provider.attributes()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl dyn Managed {
    pub fn downcast_ref<T: Managed>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: Managed>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}

/// Fill an unset desired-state field from the value the external system
/// defaulted it to. An explicitly set field is never overwritten.
///
/// Returns true if the field was filled.
pub fn late_init<T>(field: &mut Option<T>, observed: Option<T>) -> bool {
    match (field.as_ref(), observed) {
        (None, Some(value)) => {
            *field = Some(value);
            true
        }
        _ => false,
    }
}
