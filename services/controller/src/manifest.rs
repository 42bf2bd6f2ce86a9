//! Startup manifest: resources, provider configs, secrets, imported
//! reference targets and the seed state of the in-memory provider APIs.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use xrm_kinds::{ElbAttachment, GroupPolicyAttachment, RouteTable};
use xrm_reconcile::{Managed, ProviderConfig, SecretKeySelector, Target};

use crate::store::ResourceStore;

/// One managed resource, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ManifestResource {
    GroupPolicyAttachment(GroupPolicyAttachment),
    ElbAttachment(ElbAttachment),
    RouteTable(RouteTable),
}

impl ManifestResource {
    pub fn into_managed(self) -> Box<dyn Managed> {
        match self {
            Self::GroupPolicyAttachment(r) => Box::new(r),
            Self::ElbAttachment(r) => Box::new(r),
            Self::RouteTable(r) => Box::new(r),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretEntry {
    #[serde(flatten)]
    pub selector: SecretKeySelector,
    pub value: String,
}

/// A resource this controller does not manage but may reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedResource {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub external_name: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl From<ImportedResource> for Target {
    fn from(r: ImportedResource) -> Self {
        Target {
            kind: r.kind,
            name: r.name,
            labels: r.labels,
            external_name: r.external_name,
            attributes: r.attributes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAttachmentSeed {
    pub group: String,
    pub policy_arn: String,
}

/// Objects that already exist in the provider when the controller starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSeed {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub group_attachments: Vec<GroupAttachmentSeed>,
    #[serde(default)]
    pub load_balancers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub secrets: Vec<SecretEntry>,
    #[serde(default)]
    pub imports: Vec<ImportedResource>,
    #[serde(default)]
    pub resources: Vec<ManifestResource>,
    #[serde(default)]
    pub seed: ProviderSeed,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing manifest {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load everything but the provider seed into `store`.
    pub fn populate(self, store: &ResourceStore) {
        for config in self.providers {
            store.insert_provider(config);
        }
        for secret in self.secrets {
            store.insert_secret(&secret.selector, secret.value);
        }
        for import in self.imports {
            store.import(import.into());
        }
        for resource in self.resources {
            store.insert(resource.into_managed());
        }
    }
}
