//! In-memory provider config and credential stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use xrm_reconcile::{
    CredentialStore, ProviderConfig, ProviderConfigStore, SecretKeySelector, StoreError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Counted<T> {
    items: Mutex<HashMap<String, T>>,
    calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl<T> Default for Counted<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl<T: Clone> Counted<T> {
    fn read(&self, kind: &'static str, key: &str) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("{kind} store unavailable").into()));
        }
        lock(&self.items)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                name: key.to_string(),
            })
    }
}

/// Provider configs keyed by name.
///
/// Clones share state, so a test can keep a handle after moving one into a
/// connector.
#[derive(Debug, Clone, Default)]
pub struct MemoryProviderStore {
    inner: Arc<Counted<ProviderConfig>>,
}

impl MemoryProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, config: ProviderConfig) -> Self {
        self.insert(config);
        self
    }

    pub fn insert(&self, config: ProviderConfig) {
        lock(&self.inner.items).insert(config.name.clone(), config);
    }

    pub fn remove(&self, name: &str) -> Option<ProviderConfig> {
        lock(&self.inner.items).remove(name)
    }

    /// Make every read fail with a backend error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `get` calls so far.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderConfigStore for MemoryProviderStore {
    async fn get(&self, name: &str) -> Result<ProviderConfig, StoreError> {
        self.inner.read("ProviderConfig", name)
    }
}

/// Secret values keyed by selector.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<Counted<Vec<u8>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, selector: &SecretKeySelector, value: impl Into<Vec<u8>>) -> Self {
        self.insert(selector, value);
        self
    }

    pub fn insert(&self, selector: &SecretKeySelector, value: impl Into<Vec<u8>>) {
        lock(&self.inner.items).insert(selector.to_string(), value.into());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `fetch` calls so far.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn fetch(&self, selector: &SecretKeySelector) -> Result<Vec<u8>, StoreError> {
        self.inner.read("Secret", &selector.to_string())
    }
}
