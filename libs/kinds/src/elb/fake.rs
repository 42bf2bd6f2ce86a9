use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ElbApi, LoadBalancerDescription};
use crate::api::{lock, ApiError, Faults};

#[derive(Debug, Default)]
struct State {
    load_balancers: Mutex<Vec<LoadBalancerDescription>>,
    faults: Faults,
}

/// In-memory classic load balancing.
///
/// Names are not unique here, so a test can simulate the API returning more
/// than one description for a name.
#[derive(Debug, Clone, Default)]
pub struct FakeElb {
    state: Arc<State>,
}

impl FakeElb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_balancer(self, name: &str) -> Self {
        lock(&self.state.load_balancers).push(LoadBalancerDescription {
            name: name.to_string(),
            dns_name: format!("{name}.elb.amazonaws.com"),
            instances: Vec::new(),
        });
        self
    }

    /// Instances registered with the first load balancer named `name`.
    pub fn instances(&self, name: &str) -> Vec<String> {
        lock(&self.state.load_balancers)
            .iter()
            .find(|lb| lb.name == name)
            .map(|lb| lb.instances.clone())
            .unwrap_or_default()
    }

    /// Fail every call of `op` (`describe`, `register` or `deregister`).
    pub fn inject_failure(&self, op: &'static str, err: ApiError) {
        self.state.faults.inject(op, err);
    }

    pub fn heal(&self, op: &'static str) {
        self.state.faults.heal(op);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.faults.calls()
    }

    fn update(
        &self,
        elb_name: &str,
        f: impl FnOnce(&mut Vec<String>),
    ) -> Result<(), ApiError> {
        let mut lbs = lock(&self.state.load_balancers);
        let lb = lbs
            .iter_mut()
            .find(|lb| lb.name == elb_name)
            .ok_or_else(|| ApiError::not_found("LoadBalancer", elb_name))?;
        f(&mut lb.instances);
        Ok(())
    }
}

#[async_trait]
impl ElbApi for FakeElb {
    async fn describe_load_balancers(
        &self,
        names: &[String],
    ) -> Result<Vec<LoadBalancerDescription>, ApiError> {
        self.state.faults.call("describe")?;
        let lbs = lock(&self.state.load_balancers);
        if let Some(missing) = names.iter().find(|n| !lbs.iter().any(|lb| &lb.name == *n)) {
            return Err(ApiError::not_found("LoadBalancer", missing.as_str()));
        }
        Ok(lbs
            .iter()
            .filter(|lb| names.contains(&lb.name))
            .cloned()
            .collect())
    }

    async fn register_instances(
        &self,
        elb_name: &str,
        instances: &[String],
    ) -> Result<(), ApiError> {
        self.state.faults.call("register")?;
        self.update(elb_name, |registered| {
            for id in instances {
                if !registered.contains(id) {
                    registered.push(id.clone());
                }
            }
        })
    }

    async fn deregister_instances(
        &self,
        elb_name: &str,
        instances: &[String],
    ) -> Result<(), ApiError> {
        self.state.faults.call("deregister")?;
        self.update(elb_name, |registered| {
            registered.retain(|id| !instances.contains(id));
        })
    }
}
