//! IAM group policy attachments.
//!
//! Attaches one managed policy to one group. The attachment has no mutable
//! fields, so an existing attachment is always up to date; its external
//! identity is the policy ARN.

mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xrm_reconcile::{
    BoxError, ClientFactory, ClientTarget, Credentials, Drift, ExternalClient, ExternalCreation,
    ExternalObservation, Observation, Parameters, Reference, ReferenceField, Resource,
};

use crate::api::{ApiError, ApiFactory};

pub use fake::FakeIam;

/// Kind of the resources group names are resolved from.
pub const GROUP_KIND: &str = "Group";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPolicyAttachmentParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Reference::is_none")]
    pub group_name_ref: Reference,
    pub policy_arn: String,
}

impl Parameters for GroupPolicyAttachmentParameters {
    const KIND: &'static str = "GroupPolicyAttachment";

    fn reference_fields(&self) -> Vec<ReferenceField> {
        vec![ReferenceField::external_name(
            "groupName",
            self.group_name.as_deref(),
            &self.group_name_ref,
            GROUP_KIND,
        )]
    }

    fn apply_reference(&mut self, path: &str, value: String) -> bool {
        match path {
            "groupName" => {
                self.group_name = Some(value);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPolicyAttachmentObservation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_policy_arn: Option<String>,
}

impl Observation for GroupPolicyAttachmentObservation {}

pub type GroupPolicyAttachment =
    Resource<GroupPolicyAttachmentParameters, GroupPolicyAttachmentObservation>;

/// A managed policy attached to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedPolicy {
    pub policy_name: String,
    pub policy_arn: String,
}

/// The IAM operations this kind needs.
#[async_trait]
pub trait IamApi: Send + Sync {
    async fn list_attached_group_policies(
        &self,
        group_name: &str,
    ) -> Result<Vec<AttachedPolicy>, ApiError>;

    async fn attach_group_policy(&self, group_name: &str, policy_arn: &str)
        -> Result<(), ApiError>;

    async fn detach_group_policy(&self, group_name: &str, policy_arn: &str)
        -> Result<(), ApiError>;
}

fn group_name(cr: &GroupPolicyAttachment) -> Result<&str, ApiError> {
    cr.params()
        .group_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::InvalidParameter("groupName is required".into()))
}

/// External client for [`GroupPolicyAttachment`].
#[derive(Debug, Clone)]
pub struct GroupPolicyAttachmentClient<A> {
    api: A,
}

impl<A: IamApi> GroupPolicyAttachmentClient<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }
}

#[async_trait]
impl<A: IamApi> ExternalClient<GroupPolicyAttachment> for GroupPolicyAttachmentClient<A> {
    type Error = ApiError;

    async fn observe(
        &self,
        cr: &mut GroupPolicyAttachment,
    ) -> Result<ExternalObservation, ApiError> {
        let group = group_name(cr)?;
        let policy_arn = cr.params().policy_arn.clone();

        let attached = self.api.list_attached_group_policies(group).await?;
        let Some(policy) = attached.into_iter().find(|p| p.policy_arn == policy_arn) else {
            debug!(group, policy_arn = %policy_arn, "Policy not attached");
            return Ok(ExternalObservation::absent());
        };

        cr.set_observation(GroupPolicyAttachmentObservation {
            attached_policy_arn: Some(policy.policy_arn.clone()),
        });
        Ok(ExternalObservation::up_to_date().with_identity(policy.policy_arn))
    }

    async fn create(&self, cr: &mut GroupPolicyAttachment) -> Result<ExternalCreation, ApiError> {
        let group = group_name(cr)?;
        let policy_arn = &cr.params().policy_arn;

        self.api.attach_group_policy(group, policy_arn).await?;
        Ok(ExternalCreation::with_identity(policy_arn.clone()))
    }

    async fn update(
        &self,
        _cr: &mut GroupPolicyAttachment,
        _drift: &Drift,
    ) -> Result<(), ApiError> {
        // Attachments have nothing to update.
        Ok(())
    }

    async fn delete(&self, cr: &mut GroupPolicyAttachment) -> Result<(), ApiError> {
        let group = group_name(cr)?;
        self.api
            .detach_group_policy(group, &cr.params().policy_arn)
            .await
    }

    fn is_not_found(&self, err: &ApiError) -> bool {
        err.is_not_found()
    }
}

#[async_trait]
impl<A> ClientFactory<GroupPolicyAttachment> for ApiFactory<A>
where
    A: IamApi + Clone + 'static,
{
    type Client = GroupPolicyAttachmentClient<A>;

    async fn new_client(
        &self,
        target: &ClientTarget,
        credentials: &Credentials,
    ) -> Result<Self::Client, BoxError> {
        Ok(GroupPolicyAttachmentClient::new(
            self.connect(target, credentials)?,
        ))
    }
}
