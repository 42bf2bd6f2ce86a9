//! Classic load balancer instance attachments.
//!
//! Registers one instance with one load balancer. The identity is
//! `{elb_name}/{instance_id}`; there is nothing to update.

mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use xrm_reconcile::{
    BoxError, ClientFactory, ClientTarget, Credentials, Drift, ExternalClient, ExternalCreation,
    ExternalObservation, Observation, Parameters, Resource,
};

use crate::api::{ApiError, ApiFactory};

pub use fake::FakeElb;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElbAttachmentParameters {
    pub elb_name: String,
    pub instance_id: String,
}

impl Parameters for ElbAttachmentParameters {
    const KIND: &'static str = "ElbAttachment";
}

impl ElbAttachmentParameters {
    fn identity(&self) -> String {
        format!("{}/{}", self.elb_name, self.instance_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElbAttachmentObservation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    #[serde(default)]
    pub registered_instances: usize,
}

impl Observation for ElbAttachmentObservation {}

pub type ElbAttachment = Resource<ElbAttachmentParameters, ElbAttachmentObservation>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerDescription {
    pub name: String,
    pub dns_name: String,
    pub instances: Vec<String>,
}

/// The load balancing operations this kind needs.
#[async_trait]
pub trait ElbApi: Send + Sync {
    /// Describe load balancers by name. An unknown name fails with
    /// [`ApiError::NotFound`].
    async fn describe_load_balancers(
        &self,
        names: &[String],
    ) -> Result<Vec<LoadBalancerDescription>, ApiError>;

    async fn register_instances(&self, elb_name: &str, instances: &[String])
        -> Result<(), ApiError>;

    async fn deregister_instances(
        &self,
        elb_name: &str,
        instances: &[String],
    ) -> Result<(), ApiError>;
}

/// External client for [`ElbAttachment`].
#[derive(Debug, Clone)]
pub struct ElbAttachmentClient<A> {
    api: A,
}

impl<A: ElbApi> ElbAttachmentClient<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }
}

#[async_trait]
impl<A: ElbApi> ExternalClient<ElbAttachment> for ElbAttachmentClient<A> {
    type Error = ApiError;

    async fn observe(&self, cr: &mut ElbAttachment) -> Result<ExternalObservation, ApiError> {
        let params = cr.params().clone();
        let mut found = self
            .api
            .describe_load_balancers(&[params.elb_name.clone()])
            .await?;

        if found.len() != 1 {
            return Err(ApiError::UnexpectedResponse(format!(
                "retrieved {} load balancers named {}",
                found.len(),
                params.elb_name
            )));
        }
        let lb = found.remove(0);

        if !lb.instances.contains(&params.instance_id) {
            return Ok(ExternalObservation::absent());
        }

        cr.set_observation(ElbAttachmentObservation {
            dns_name: Some(lb.dns_name),
            registered_instances: lb.instances.len(),
        });
        Ok(ExternalObservation::up_to_date().with_identity(params.identity()))
    }

    async fn create(&self, cr: &mut ElbAttachment) -> Result<ExternalCreation, ApiError> {
        let params = cr.params();
        self.api
            .register_instances(&params.elb_name, &[params.instance_id.clone()])
            .await?;
        Ok(ExternalCreation::with_identity(params.identity()))
    }

    async fn update(&self, _cr: &mut ElbAttachment, _drift: &Drift) -> Result<(), ApiError> {
        Ok(())
    }

    async fn delete(&self, cr: &mut ElbAttachment) -> Result<(), ApiError> {
        let params = cr.params();
        self.api
            .deregister_instances(&params.elb_name, &[params.instance_id.clone()])
            .await
    }

    fn is_not_found(&self, err: &ApiError) -> bool {
        err.is_not_found()
    }
}

#[async_trait]
impl<A> ClientFactory<ElbAttachment> for ApiFactory<A>
where
    A: ElbApi + Clone + 'static,
{
    type Client = ElbAttachmentClient<A>;

    async fn new_client(
        &self,
        target: &ClientTarget,
        credentials: &Credentials,
    ) -> Result<Self::Client, BoxError> {
        Ok(ElbAttachmentClient::new(self.connect(target, credentials)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment() -> ElbAttachment {
        Resource::new(
            "web-1",
            "aws",
            ElbAttachmentParameters {
                elb_name: "web".into(),
                instance_id: "i-0abc".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_registered_instance_is_up_to_date() {
        let elb = FakeElb::new().with_load_balancer("web");
        let client = ElbAttachmentClient::new(elb.clone());
        let mut cr = attachment();

        assert!(!client.observe(&mut cr).await.unwrap().exists);

        let created = client.create(&mut cr).await.unwrap();
        assert_eq!(created.identity.as_deref(), Some("web/i-0abc"));

        let obs = client.observe(&mut cr).await.unwrap();
        assert!(obs.exists && obs.up_to_date);
        assert_eq!(obs.identity.as_deref(), Some("web/i-0abc"));
        assert_eq!(cr.observation().registered_instances, 1);
    }

    #[tokio::test]
    async fn test_unknown_load_balancer_is_not_found() {
        let client = ElbAttachmentClient::new(FakeElb::new());
        let mut cr = attachment();

        let err = client.observe(&mut cr).await.unwrap_err();
        assert!(client.is_not_found(&err));
    }

    #[tokio::test]
    async fn test_multiple_descriptions_fail() {
        let elb = FakeElb::new()
            .with_load_balancer("web")
            .with_load_balancer("web");
        let client = ElbAttachmentClient::new(elb);
        let mut cr = attachment();

        let err = client.observe(&mut cr).await.unwrap_err();
        assert!(matches!(err, ApiError::UnexpectedResponse(_)));
        assert!(!client.is_not_found(&err));
    }

    #[tokio::test]
    async fn test_deregister() {
        let elb = FakeElb::new().with_load_balancer("web");
        let client = ElbAttachmentClient::new(elb.clone());
        let mut cr = attachment();
        client.create(&mut cr).await.unwrap();

        client.delete(&mut cr).await.unwrap();
        assert!(elb.instances("web").is_empty());
    }
}
