//! VPC route tables.
//!
//! Create makes a bare table in the VPC. Routes, subnet associations and tags
//! are converged by the passes after it: a table that exists but lacks some
//! of them is reported as drifted and the engine drives an update. A
//! partially converged table therefore never causes another create.

mod fake;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xrm_reconcile::{
    late_init, BoxError, ClientFactory, ClientTarget, Credentials, Drift, ExternalClient,
    ExternalCreation, ExternalObservation, Managed, Observation, Parameters, Reference,
    ReferenceField, Resource,
};

use crate::api::{ApiError, ApiFactory};

pub use fake::FakeEc2;

pub const VPC_KIND: &str = "Vpc";
pub const INTERNET_GATEWAY_KIND: &str = "InternetGateway";
pub const SUBNET_KIND: &str = "Subnet";

const DRIFT_ROUTES: &str = "routes";
const DRIFT_ASSOCIATIONS: &str = "associations";
const DRIFT_TAGS: &str = "tags";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub destination_cidr_block: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(default, skip_serializing_if = "Reference::is_none")]
    pub gateway_id_ref: Reference,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Reference::is_none")]
    pub subnet_id_ref: Reference,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTableParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Reference::is_none")]
    pub vpc_id_ref: Reference,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub associations: Vec<Association>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl RouteTableParameters {
    /// Every route needs a gateway once its references are resolved.
    fn validate(&self) -> Result<(), ApiError> {
        match self.routes.iter().find(|r| r.gateway_id.is_none()) {
            Some(route) => Err(ApiError::InvalidParameter(format!(
                "route to {} has no gatewayId",
                route.destination_cidr_block
            ))),
            None => Ok(()),
        }
    }
}

/// A reference-backed field path, e.g. `routes[2].gatewayId`.
fn indexed(list: &str, index: usize, field: &str) -> String {
    format!("{list}[{index}].{field}")
}

fn parse_indexed(path: &str, list: &str, field: &str) -> Option<usize> {
    let rest = path.strip_prefix(list)?.strip_prefix('[')?;
    let (index, tail) = rest.split_once(']')?;
    if tail.strip_prefix('.')? != field {
        return None;
    }
    index.parse().ok()
}

impl Parameters for RouteTableParameters {
    const KIND: &'static str = "RouteTable";

    fn reference_fields(&self) -> Vec<ReferenceField> {
        let mut fields = vec![ReferenceField::external_name(
            "vpcId",
            self.vpc_id.as_deref(),
            &self.vpc_id_ref,
            VPC_KIND,
        )];
        fields.extend(self.routes.iter().enumerate().map(|(i, route)| {
            ReferenceField::external_name(
                indexed("routes", i, "gatewayId"),
                route.gateway_id.as_deref(),
                &route.gateway_id_ref,
                INTERNET_GATEWAY_KIND,
            )
        }));
        fields.extend(self.associations.iter().enumerate().map(|(i, assoc)| {
            ReferenceField::external_name(
                indexed("associations", i, "subnetId"),
                assoc.subnet_id.as_deref(),
                &assoc.subnet_id_ref,
                SUBNET_KIND,
            )
        }));
        fields
    }

    fn apply_reference(&mut self, path: &str, value: String) -> bool {
        if path == "vpcId" {
            self.vpc_id = Some(value);
            return true;
        }
        if let Some(route) = parse_indexed(path, "routes", "gatewayId")
            .and_then(|i| self.routes.get_mut(i))
        {
            route.gateway_id = Some(value);
            return true;
        }
        if let Some(assoc) = parse_indexed(path, "associations", "subnetId")
            .and_then(|i| self.associations.get_mut(i))
        {
            assoc.subnet_id = Some(value);
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteState {
    pub destination_cidr_block: String,
    pub gateway_id: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationState {
    pub main: bool,
    pub association_id: String,
    pub subnet_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTableObservation {
    #[serde(default)]
    pub route_table_id: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub routes: Vec<RouteState>,
    #[serde(default)]
    pub associations: Vec<AssociationState>,
}

impl Observation for RouteTableObservation {
    fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        if !self.route_table_id.is_empty() {
            attrs.insert("routeTableId".to_string(), self.route_table_id.clone());
            attrs.insert("ownerId".to_string(), self.owner_id.clone());
        }
        attrs
    }
}

pub type RouteTable = Resource<RouteTableParameters, RouteTableObservation>;

/// A route table as the EC2 API describes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTableDescription {
    pub route_table_id: String,
    pub owner_id: String,
    pub vpc_id: String,
    pub routes: Vec<RouteState>,
    pub associations: Vec<AssociationState>,
    pub tags: BTreeMap<String, String>,
}

/// The EC2 operations this kind needs.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Fails with [`ApiError::NotFound`] if the table does not exist.
    async fn describe_route_table(&self, id: &str) -> Result<RouteTableDescription, ApiError>;

    /// Returns the new table's id.
    async fn create_route_table(&self, vpc_id: &str) -> Result<String, ApiError>;

    async fn create_route(
        &self,
        route_table_id: &str,
        destination_cidr_block: &str,
        gateway_id: &str,
    ) -> Result<(), ApiError>;

    /// Points an existing route at another gateway.
    async fn replace_route(
        &self,
        route_table_id: &str,
        destination_cidr_block: &str,
        gateway_id: &str,
    ) -> Result<(), ApiError>;

    /// Returns the association id.
    async fn associate_route_table(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> Result<String, ApiError>;

    async fn create_tags(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<(), ApiError>;

    async fn delete_tags(&self, id: &str, keys: &[String]) -> Result<(), ApiError>;

    async fn delete_route_table(&self, id: &str) -> Result<(), ApiError>;
}

/// Desired routes the table does not match, each with the gateway that
/// currently serves its destination, if any.
fn route_changes<'a, 'b>(
    desired: &'a [Route],
    observed: &'b [RouteState],
) -> Vec<(&'a Route, Option<&'b str>)> {
    desired
        .iter()
        .filter_map(|route| {
            let current = observed
                .iter()
                .find(|o| o.destination_cidr_block == route.destination_cidr_block);
            match current {
                Some(o) if route.gateway_id.as_deref() == Some(o.gateway_id.as_str()) => None,
                current => Some((route, current.map(|o| o.gateway_id.as_str()))),
            }
        })
        .collect()
}

fn missing_associations<'a>(
    desired: &'a [Association],
    observed: &[AssociationState],
) -> Vec<&'a Association> {
    desired
        .iter()
        .filter(|assoc| {
            !observed
                .iter()
                .any(|o| assoc.subnet_id.as_deref() == Some(o.subnet_id.as_str()))
        })
        .collect()
}

fn drift(params: &RouteTableParameters, observed: &RouteTableDescription) -> Drift {
    let mut drift = Drift::new();
    if !route_changes(&params.routes, &observed.routes).is_empty() {
        drift.push(DRIFT_ROUTES);
    }
    if !missing_associations(&params.associations, &observed.associations).is_empty() {
        drift.push(DRIFT_ASSOCIATIONS);
    }
    if params.tags != observed.tags {
        drift.push(DRIFT_TAGS);
    }
    drift
}

/// External client for [`RouteTable`].
#[derive(Debug, Clone)]
pub struct RouteTableClient<A> {
    api: A,
}

impl<A: Ec2Api> RouteTableClient<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    async fn converge_tags(
        &self,
        id: &str,
        desired: &BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let observed = self.api.describe_route_table(id).await?.tags;

        let stale: Vec<String> = observed
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();
        if !stale.is_empty() {
            self.api.delete_tags(id, &stale).await?;
        }

        let changed: BTreeMap<String, String> = desired
            .iter()
            .filter(|(k, v)| observed.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !changed.is_empty() {
            self.api.create_tags(id, &changed).await?;
        }
        Ok(())
    }
}

fn table_id(cr: &RouteTable) -> Result<&str, ApiError> {
    cr.meta()
        .external_name
        .as_deref()
        .ok_or_else(|| ApiError::InvalidParameter("route table has no id yet".into()))
}

#[async_trait]
impl<A: Ec2Api> ExternalClient<RouteTable> for RouteTableClient<A> {
    type Error = ApiError;

    async fn observe(&self, cr: &mut RouteTable) -> Result<ExternalObservation, ApiError> {
        // A table being deleted only needs its id.
        if !cr.meta().is_deletion_requested() {
            cr.params().validate()?;
        }
        let Some(id) = cr.meta().external_name.clone() else {
            return Ok(ExternalObservation::absent());
        };

        let table = self.api.describe_route_table(&id).await?;
        let filled = late_init(&mut cr.params_mut().vpc_id, Some(table.vpc_id.clone()));
        let drift = drift(cr.params(), &table);
        debug!(route_table = %id, drifted = ?drift, "Described route table");

        cr.set_observation(RouteTableObservation {
            route_table_id: table.route_table_id,
            owner_id: table.owner_id,
            routes: table.routes,
            associations: table.associations,
        });
        Ok(ExternalObservation::drifted(drift).with_late_init(filled))
    }

    async fn create(&self, cr: &mut RouteTable) -> Result<ExternalCreation, ApiError> {
        if let Some(id) = &cr.meta().external_name {
            // The recorded table vanished. Its identity cannot be replaced.
            return Err(ApiError::InvalidParameter(format!(
                "route table {id} no longer exists"
            )));
        }
        let vpc_id = cr
            .params()
            .vpc_id
            .as_deref()
            .ok_or_else(|| ApiError::InvalidParameter("vpcId is required".into()))?;

        let id = self.api.create_route_table(vpc_id).await?;
        Ok(ExternalCreation::with_identity(id))
    }

    async fn update(&self, cr: &mut RouteTable, drift: &Drift) -> Result<(), ApiError> {
        let id = table_id(cr)?;
        let params = cr.params();

        if drift.contains(DRIFT_ROUTES) {
            let observed = self.api.describe_route_table(id).await?.routes;
            params.validate()?;
            for (route, current) in route_changes(&params.routes, &observed) {
                let destination = route.destination_cidr_block.as_str();
                let gateway = route.gateway_id.as_deref().unwrap_or_default();
                match current {
                    Some(previous) => {
                        debug!(destination, previous, gateway, "Replacing route");
                        self.api.replace_route(id, destination, gateway).await?;
                    }
                    None => self.api.create_route(id, destination, gateway).await?,
                }
            }
        }

        if drift.contains(DRIFT_ASSOCIATIONS) {
            let observed = self.api.describe_route_table(id).await?.associations;
            for assoc in missing_associations(&params.associations, &observed) {
                let subnet = assoc.subnet_id.as_deref().ok_or_else(|| {
                    ApiError::InvalidParameter("association has no subnetId".into())
                })?;
                self.api.associate_route_table(id, subnet).await?;
            }
        }

        if drift.contains(DRIFT_TAGS) {
            self.converge_tags(id, &params.tags).await?;
        }
        Ok(())
    }

    async fn delete(&self, cr: &mut RouteTable) -> Result<(), ApiError> {
        let id = table_id(cr)?;
        self.api.delete_route_table(id).await
    }

    fn is_not_found(&self, err: &ApiError) -> bool {
        err.is_not_found()
    }
}

#[async_trait]
impl<A> ClientFactory<RouteTable> for ApiFactory<A>
where
    A: Ec2Api + Clone + 'static,
{
    type Client = RouteTableClient<A>;

    async fn new_client(
        &self,
        target: &ClientTarget,
        credentials: &Credentials,
    ) -> Result<Self::Client, BoxError> {
        Ok(RouteTableClient::new(self.connect(target, credentials)?))
    }
}
