//! In-memory resource lookup for reference resolution.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use xrm_reconcile::{Managed, ResourceLookup, StoreError, Target};

#[derive(Debug, Default)]
struct Inner {
    targets: Mutex<BTreeMap<(String, String), Target>>,
    gets: AtomicUsize,
    lists: AtomicUsize,
    unavailable: AtomicBool,
}

/// Snapshot store of referenceable resources, keyed by kind and name.
#[derive(Debug, Clone, Default)]
pub struct MemoryLookup {
    inner: Arc<Inner>,
}

impl MemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot `resource` as it is now. Later changes need another insert.
    pub fn insert(&self, resource: &dyn Managed) {
        self.insert_target(Target::of(resource));
    }

    pub fn insert_target(&self, target: Target) {
        self.targets()
            .insert((target.kind.clone(), target.name.clone()), target);
    }

    pub fn remove(&self, kind: &str, name: &str) -> Option<Target> {
        self.targets().remove(&(kind.to_string(), name.to_string()))
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.inner.gets.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.inner.lists.load(Ordering::SeqCst)
    }

    fn targets(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Target>> {
        self.inner
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("resource lookup unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceLookup for MemoryLookup {
    async fn get(&self, kind: &str, name: &str) -> Result<Option<Target>, StoreError> {
        self.inner.gets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .targets()
            .get(&(kind.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        kind: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Target>, StoreError> {
        self.inner.lists.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .targets()
            .values()
            .filter(|t| t.kind == kind)
            .filter(|t| labels.iter().all(|(k, v)| t.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}
