//! Connecting a resource to a bound external client.
//!
//! The connector reads the resource's provider config, resolves credentials
//! in one of two mutually exclusive modes (ambient identity or a referenced
//! secret), and hands both to a [`ClientFactory`]. It performs no writes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::context::PassContext;
use crate::error::{BoxError, Phase, ReconcileError, StoreError};
use crate::external::ExternalClient;
use crate::resource::Managed;

/// Points at one key of a stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretKeySelector {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

impl fmt::Display for SecretKeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[{}]", self.namespace, self.name, self.key)
    }
}

/// Where and as whom to talk to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub name: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Use the ambient workload identity instead of a stored secret.
    #[serde(default)]
    pub use_ambient_identity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<SecretKeySelector>,
}

/// Resolved credential material.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Ambient,
    Secret(Vec<u8>),
}

impl Credentials {
    /// Short hex fingerprint of the credential material.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Credentials::Ambient => hasher.update(b"ambient"),
            Credentials::Secret(bytes) => {
                hasher.update(b"secret:");
                hasher.update(bytes);
            }
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Ambient => f.write_str("Ambient"),
            Credentials::Secret(bytes) => write!(f, "Secret(<{} bytes redacted>)", bytes.len()),
        }
    }
}

/// The account/region a client is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientTarget {
    pub provider: String,
    pub region: String,
    pub endpoint: Option<String>,
}

#[async_trait]
pub trait ProviderConfigStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<ProviderConfig, StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn fetch(&self, selector: &SecretKeySelector) -> Result<Vec<u8>, StoreError>;
}

/// Builds provider API clients. The construction itself is provider-specific.
#[async_trait]
pub trait ClientFactory<R: Managed>: Send + Sync {
    type Client: ExternalClient<R>;

    async fn new_client(
        &self,
        target: &ClientTarget,
        credentials: &Credentials,
    ) -> Result<Self::Client, BoxError>;
}

/// Produces a bound client for one resource, fresh for each pass.
#[async_trait]
pub trait Connector<R: Managed>: Send + Sync {
    type Client: ExternalClient<R>;

    async fn connect(&self, ctx: &PassContext, cr: &R) -> Result<Self::Client, ReconcileError>;
}

/// Connector backed by a provider config store and a credential store.
pub struct ProviderConnector<P, S, F> {
    providers: P,
    credentials: S,
    factory: F,
}

impl<P, S, F> ProviderConnector<P, S, F> {
    pub fn new(providers: P, credentials: S, factory: F) -> Self {
        Self {
            providers,
            credentials,
            factory,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

impl<P, S, F> ProviderConnector<P, S, F>
where
    P: ProviderConfigStore,
    S: CredentialStore,
{
    async fn credentials_for(
        &self,
        ctx: &PassContext,
        provider: &ProviderConfig,
    ) -> Result<Credentials, ReconcileError> {
        if provider.use_ambient_identity {
            return Ok(Credentials::Ambient);
        }

        let selector = provider.credentials.as_ref().ok_or_else(|| {
            ReconcileError::CredentialSourceMissing {
                provider: provider.name.clone(),
            }
        })?;

        let bytes = ctx
            .run(Phase::Connect, self.credentials.fetch(selector))
            .await?
            .map_err(|source| ReconcileError::CredentialFetchFailed {
                reference: selector.to_string(),
                source,
            })?;
        Ok(Credentials::Secret(bytes))
    }
}

#[async_trait]
impl<R, P, S, F> Connector<R> for ProviderConnector<P, S, F>
where
    R: Managed,
    P: ProviderConfigStore,
    S: CredentialStore,
    F: ClientFactory<R>,
{
    type Client = F::Client;

    async fn connect(&self, ctx: &PassContext, cr: &R) -> Result<Self::Client, ReconcileError> {
        let provider_name = cr.provider_config_ref();
        if provider_name.is_empty() {
            return Err(ReconcileError::InvalidInput(format!(
                "{} {} has no provider config reference",
                cr.kind(),
                cr.meta().name
            )));
        }

        let provider = ctx
            .run(Phase::Connect, self.providers.get(provider_name))
            .await?
            .map_err(|source| ReconcileError::ProviderNotFound {
                name: provider_name.to_string(),
                source,
            })?;

        let credentials = self.credentials_for(ctx, &provider).await?;
        let target = ClientTarget {
            provider: provider.name.clone(),
            region: provider.region.clone(),
            endpoint: provider.endpoint.clone(),
        };

        debug!(
            provider = %target.provider,
            region = %target.region,
            ambient = provider.use_ambient_identity,
            "Building external client"
        );

        ctx.run(Phase::Connect, self.factory.new_client(&target, &credentials))
            .await?
            .map_err(|source| ReconcileError::ClientConstructionFailed {
                provider: target.provider.clone(),
                region: target.region.clone(),
                source,
            })
    }
}

/// Cache key: a credential change always yields a new key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    target: ClientTarget,
    credential_hash: String,
}

/// [`ClientFactory`] wrapper that reuses clients per
/// (provider, region, credential hash).
///
/// Clients must be cheap handles (`Clone` over shared connection state).
pub struct CachingFactory<F, C> {
    inner: F,
    clients: Mutex<HashMap<CacheKey, C>>,
}

impl<F, C> CachingFactory<F, C> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every cached client of `provider`.
    pub fn invalidate_provider(&self, provider: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.retain(|key, _| key.target.provider != provider);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<R, F, C> ClientFactory<R> for CachingFactory<F, C>
where
    R: Managed,
    F: ClientFactory<R, Client = C>,
    C: ExternalClient<R> + Clone + 'static,
{
    type Client = C;

    async fn new_client(
        &self,
        target: &ClientTarget,
        credentials: &Credentials,
    ) -> Result<C, BoxError> {
        let key = CacheKey {
            target: target.clone(),
            credential_hash: credentials.fingerprint(),
        };

        if let Some(client) = self.clients.lock().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(client);
        }

        let client = self.inner.new_client(target, credentials).await?;
        if let Ok(mut clients) = self.clients.lock() {
            // A rotated credential leaves the old entry unreachable; drop it.
            clients.retain(|k, _| k.target != key.target);
            clients.insert(key, client.clone());
        }
        Ok(client)
    }
}
