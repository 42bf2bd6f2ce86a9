use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{AttachedPolicy, IamApi};
use crate::api::{lock, ApiError, Faults};

#[derive(Debug, Default)]
struct State {
    groups: Mutex<BTreeMap<String, BTreeSet<String>>>,
    faults: Faults,
}

/// In-memory IAM. Groups must exist before policies can be attached.
#[derive(Debug, Clone, Default)]
pub struct FakeIam {
    state: Arc<State>,
}

impl FakeIam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, name: &str) -> Self {
        self.add_group(name);
        self
    }

    pub fn add_group(&self, name: &str) {
        lock(&self.state.groups).entry(name.to_string()).or_default();
    }

    /// Seed an attachment directly, bypassing ARN validation.
    pub fn with_attachment(self, group: &str, policy_arn: &str) -> Self {
        lock(&self.state.groups)
            .entry(group.to_string())
            .or_default()
            .insert(policy_arn.to_string());
        self
    }

    pub fn is_attached(&self, group: &str, policy_arn: &str) -> bool {
        lock(&self.state.groups)
            .get(group)
            .is_some_and(|policies| policies.contains(policy_arn))
    }

    /// Fail every call of `op` (`list`, `attach` or `detach`).
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

    fn with_policies<T>(
        &self,
        group: &str,
        f: impl FnOnce(&mut BTreeSet<String>) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut groups = lock(&self.state.groups);
        let policies = groups
            .get_mut(group)
            .ok_or_else(|| ApiError::not_found("Group", group))?;
        f(policies)
    }
}

fn policy_name(arn: &str) -> String {
    arn.rsplit('/').next().unwrap_or(arn).to_string()
}

#[async_trait]
impl IamApi for FakeIam {
    async fn list_attached_group_policies(
        &self,
        group_name: &str,
    ) -> Result<Vec<AttachedPolicy>, ApiError> {
        self.state.faults.call("list")?;
        self.with_policies(group_name, |policies| {
            Ok(policies
                .iter()
                .map(|arn| AttachedPolicy {
                    policy_name: policy_name(arn),
                    policy_arn: arn.clone(),
                })
                .collect())
        })
    }

    async fn attach_group_policy(
        &self,
        group_name: &str,
        policy_arn: &str,
    ) -> Result<(), ApiError> {
        self.state.faults.call("attach")?;
        if !policy_arn.starts_with("arn:") {
            return Err(ApiError::InvalidParameter(format!(
                "{policy_arn} is not a valid ARN"
            )));
        }
        self.with_policies(group_name, |policies| {
            policies.insert(policy_arn.to_string());
            Ok(())
        })
    }

    async fn detach_group_policy(
        &self,
        group_name: &str,
        policy_arn: &str,
    ) -> Result<(), ApiError> {
        self.state.faults.call("detach")?;
        self.with_policies(group_name, |policies| {
            if policies.remove(policy_arn) {
                Ok(())
            } else {
                Err(ApiError::not_found("Policy", policy_arn))
            }
        })
    }
}
