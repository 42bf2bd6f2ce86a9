use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{AssociationState, Ec2Api, RouteState, RouteTableDescription};
use crate::api::{lock, ApiError, Faults};

const OWNER_ID: &str = "123456789012";

#[derive(Debug, Default)]
struct State {
    tables: Mutex<HashMap<String, RouteTableDescription>>,
    next_id: AtomicU64,
    faults: Faults,
}

/// In-memory EC2 route tables.
///
/// Call names for fault injection: `describe`, `create_route_table`,
/// `create_route`, `replace_route`, `associate`, `create_tags`, `delete_tags`, `delete`.
#[derive(Debug, Clone, Default)]
pub struct FakeEc2 {
    state: Arc<State>,
}

impl FakeEc2 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_failure(&self, op: &'static str, err: ApiError) {
        self.state.faults.inject(op, err);
    }

    pub fn heal(&self, op: &'static str) {
        self.state.faults.heal(op);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.faults.calls()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state.faults.count(op)
    }

    /// Number of route tables that exist.
    pub fn table_count(&self) -> usize {
        lock(&self.state.tables).len()
    }

    /// Delete a table behind the controller's back.
    pub fn remove_table(&self, id: &str) -> bool {
        lock(&self.state.tables).remove(id).is_some()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{n:08x}")
    }

    fn with_table<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut RouteTableDescription) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut tables = lock(&self.state.tables);
        let table = tables
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found("RouteTable", id))?;
        f(table)
    }
}

#[async_trait]
impl Ec2Api for FakeEc2 {
    async fn describe_route_table(&self, id: &str) -> Result<RouteTableDescription, ApiError> {
        self.state.faults.call("describe")?;
        self.with_table(id, |table| Ok(table.clone()))
    }

    async fn create_route_table(&self, vpc_id: &str) -> Result<String, ApiError> {
        self.state.faults.call("create_route_table")?;
        if !vpc_id.starts_with("vpc-") {
            return Err(ApiError::InvalidParameter(format!("invalid VPC id {vpc_id}")));
        }
        let id = self.next_id("rtb");
        lock(&self.state.tables).insert(
            id.clone(),
            RouteTableDescription {
                route_table_id: id.clone(),
                owner_id: OWNER_ID.to_string(),
                vpc_id: vpc_id.to_string(),
                ..Default::default()
            },
        );
        Ok(id)
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination_cidr_block: &str,
        gateway_id: &str,
    ) -> Result<(), ApiError> {
        self.state.faults.call("create_route")?;
        self.with_table(route_table_id, |table| {
            if table
                .routes
                .iter()
                .any(|r| r.destination_cidr_block == destination_cidr_block)
            {
                return Err(ApiError::InvalidParameter(format!(
                    "route {destination_cidr_block} already exists"
                )));
            }
            table.routes.push(RouteState {
                destination_cidr_block: destination_cidr_block.to_string(),
                gateway_id: gateway_id.to_string(),
                state: "active".to_string(),
            });
            Ok(())
        })
    }

    async fn replace_route(
        &self,
        route_table_id: &str,
        destination_cidr_block: &str,
        gateway_id: &str,
    ) -> Result<(), ApiError> {
        self.state.faults.call("replace_route")?;
        self.with_table(route_table_id, |table| {
            let route = table
                .routes
                .iter_mut()
                .find(|r| r.destination_cidr_block == destination_cidr_block)
                .ok_or_else(|| {
                    ApiError::InvalidParameter(format!("no route to {destination_cidr_block}"))
                })?;
            route.gateway_id = gateway_id.to_string();
            Ok(())
        })
    }

    async fn associate_route_table(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> Result<String, ApiError> {
        self.state.faults.call("associate")?;
        let association_id = self.next_id("rtbassoc");
        self.with_table(route_table_id, |table| {
            table.associations.push(AssociationState {
                main: false,
                association_id: association_id.clone(),
                subnet_id: subnet_id.to_string(),
            });
            Ok(association_id)
        })
    }

    async fn create_tags(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<(), ApiError> {
        self.state.faults.call("create_tags")?;
        self.with_table(id, |table| {
            table
                .tags
                .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    async fn delete_tags(&self, id: &str, keys: &[String]) -> Result<(), ApiError> {
        self.state.faults.call("delete_tags")?;
        self.with_table(id, |table| {
            table.tags.retain(|k, _| !keys.contains(k));
            Ok(())
        })
    }

    async fn delete_route_table(&self, id: &str) -> Result<(), ApiError> {
        self.state.faults.call("delete")?;
        lock(&self.state.tables)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found("RouteTable", id))
    }
}
