//! In-memory resource store.
//!
//! Holds the managed resources of the controller together with provider
//! configs, secrets and imported reference targets. Resources are checked out
//! for the duration of a pass and put back afterwards; references always read
//! the last persisted snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error};
use xrm_reconcile::{
    CredentialStore, Managed, ProviderConfig, ProviderConfigStore, ResourceLookup,
    SecretKeySelector, StoreError, Target,
};

/// Store key of a resource: its kind and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub kind: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn of(resource: &dyn Managed) -> Self {
        Self::new(resource.kind(), resource.meta().name.clone())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("resource {0} not found")]
    NotFound(ResourceKey),

    #[error("resource {0} is already checked out")]
    Busy(ResourceKey),
}

#[derive(Debug)]
enum Slot {
    Stored(Box<dyn Managed>),
    CheckedOut,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<ResourceKey, Slot>,
    snapshots: BTreeMap<ResourceKey, Target>,
    imports: BTreeMap<ResourceKey, Target>,
    providers: HashMap<String, ProviderConfig>,
    secrets: HashMap<String, Vec<u8>>,
}

/// A resource checked out for one pass.
///
/// Dropping the guard returns the resource to the store as it was left,
/// including when the pass panics. Use [`CheckedOut::discard`] for resources
/// that are being removed.
#[derive(Debug)]
pub struct CheckedOut {
    store: ResourceStore,
    resource: Option<Box<dyn Managed>>,
}

impl CheckedOut {
    pub fn resource_mut(&mut self) -> Option<&mut dyn Managed> {
        self.resource.as_deref_mut()
    }

    /// Return the resource and publish its new snapshot.
    pub fn check_in(self) {}

    /// Drop the resource instead of returning it. The caller removes its
    /// slot with [`ResourceStore::remove`].
    pub fn discard(mut self) {
        self.resource = None;
    }
}

impl Drop for CheckedOut {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        if std::thread::panicking() {
            error!(
                resource = %ResourceKey::of(resource.as_ref()),
                "Pass panicked, returning resource to the store"
            );
        }
        self.store.put_back(resource);
    }
}

/// Shared handle to the store. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct ResourceStore {
    inner: Arc<Mutex<Inner>>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a resource.
    pub fn insert(&self, resource: Box<dyn Managed>) -> ResourceKey {
        let key = ResourceKey::of(resource.as_ref());
        let mut inner = self.inner();
        inner.snapshots.insert(key.clone(), Target::of(resource.as_ref()));
        inner.resources.insert(key.clone(), Slot::Stored(resource));
        key
    }

    /// Add a resource managed elsewhere that local resources may reference.
    pub fn import(&self, target: Target) {
        let key = ResourceKey::new(target.kind.clone(), target.name.clone());
        self.inner().imports.insert(key, target);
    }

    pub fn insert_provider(&self, config: ProviderConfig) {
        self.inner().providers.insert(config.name.clone(), config);
    }

    pub fn insert_secret(&self, selector: &SecretKeySelector, value: impl Into<Vec<u8>>) {
        self.inner()
            .secrets
            .insert(selector.to_string(), value.into());
    }

    /// Keys of every resource, including checked out ones.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.inner().resources.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.inner().resources.contains_key(key)
    }

    /// Take a resource out for a pass. Nobody else can check it out or read
    /// it until the returned guard is dropped.
    pub fn check_out(&self, key: &ResourceKey) -> Result<CheckedOut, CheckoutError> {
        let mut inner = self.inner();
        let slot = inner
            .resources
            .get_mut(key)
            .ok_or_else(|| CheckoutError::NotFound(key.clone()))?;
        match std::mem::replace(slot, Slot::CheckedOut) {
            Slot::Stored(resource) => Ok(CheckedOut {
                store: self.clone(),
                resource: Some(resource),
            }),
            Slot::CheckedOut => Err(CheckoutError::Busy(key.clone())),
        }
    }

    fn put_back(&self, resource: Box<dyn Managed>) {
        let key = ResourceKey::of(resource.as_ref());
        let mut inner = self.inner();
        if !inner.resources.contains_key(&key) {
            debug!(resource = %key, "Resource removed while checked out, dropping");
            return;
        }
        inner.snapshots.insert(key.clone(), Target::of(resource.as_ref()));
        inner.resources.insert(key, Slot::Stored(resource));
    }

    pub fn remove(&self, key: &ResourceKey) -> bool {
        let mut inner = self.inner();
        inner.snapshots.remove(key);
        inner.resources.remove(key).is_some()
    }

    /// Mark a stored resource for deletion. Returns false if it is missing or
    /// checked out.
    pub fn request_deletion(&self, key: &ResourceKey) -> bool {
        let mut inner = self.inner();
        match inner.resources.get_mut(key) {
            Some(Slot::Stored(resource)) => {
                resource.meta_mut().request_deletion();
                true
            }
            _ => false,
        }
    }

    /// Read a stored resource. Returns `None` if it is missing or checked out.
    pub fn with_resource<T>(
        &self,
        key: &ResourceKey,
        f: impl FnOnce(&dyn Managed) -> T,
    ) -> Option<T> {
        match self.inner().resources.get(key) {
            Some(Slot::Stored(resource)) => Some(f(resource.as_ref())),
            _ => None,
        }
    }

    /// Last persisted snapshot of a resource as seen by references.
    pub fn snapshot(&self, key: &ResourceKey) -> Option<Target> {
        self.inner().snapshots.get(key).cloned()
    }
}

#[async_trait]
impl ResourceLookup for ResourceStore {
    async fn get(&self, kind: &str, name: &str) -> Result<Option<Target>, StoreError> {
        let key = ResourceKey::new(kind, name);
        let inner = self.inner();
        Ok(inner
            .snapshots
            .get(&key)
            .or_else(|| inner.imports.get(&key))
            .cloned())
    }

    async fn list(
        &self,
        kind: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Target>, StoreError> {
        let inner = self.inner();
        Ok(inner
            .snapshots
            .values()
            .chain(inner.imports.values())
            .filter(|t| t.kind == kind)
            .filter(|t| labels.iter().all(|(k, v)| t.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProviderConfigStore for ResourceStore {
    async fn get(&self, name: &str) -> Result<ProviderConfig, StoreError> {
        self.inner()
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "ProviderConfig",
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl CredentialStore for ResourceStore {
    async fn fetch(&self, selector: &SecretKeySelector) -> Result<Vec<u8>, StoreError> {
        let key = selector.to_string();
        self.inner()
            .secrets
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "Secret",
                name: key,
            })
    }
}
