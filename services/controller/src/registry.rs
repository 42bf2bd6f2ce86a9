//! Per-kind engine dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use xrm_kinds::{
    ApiFactory, ElbAttachment, ElbAttachmentClient, ElbAttachmentParameters, FakeEc2, FakeElb,
    FakeIam, GroupPolicyAttachment, GroupPolicyAttachmentClient, GroupPolicyAttachmentParameters,
    RouteTable, RouteTableClient, RouteTableParameters,
};
use xrm_reconcile::{
    CachingFactory, Connector, Managed, Parameters, PassContext, PassReport, ProviderConnector,
    Reconciler, ReferenceResolver, ResourceLookup, SelectionPolicy,
};

use crate::manifest::ProviderSeed;
use crate::store::ResourceStore;

/// Object-safe handle to a [`Reconciler`] of one kind.
#[async_trait]
pub trait KindReconciler: Send + Sync {
    async fn run_pass(&self, ctx: &PassContext, resource: &mut dyn Managed) -> PassReport;
}

#[async_trait]
impl<R, C, L> KindReconciler for Reconciler<R, C, L>
where
    R: Managed,
    C: Connector<R> + 'static,
    L: ResourceLookup + 'static,
{
    async fn run_pass(&self, ctx: &PassContext, resource: &mut dyn Managed) -> PassReport {
        self.reconcile(ctx, resource).await
    }
}

/// Engines keyed by the kind they manage.
#[derive(Clone, Default)]
pub struct Registry {
    engines: BTreeMap<&'static str, Arc<dyn KindReconciler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &'static str, engine: impl KindReconciler + 'static) {
        self.engines.insert(kind, Arc::new(engine));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn KindReconciler>> {
        self.engines.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.engines.keys().copied()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.engines.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// In-memory provider APIs the controller runs against.
#[derive(Debug, Clone, Default)]
pub struct Providers {
    pub iam: FakeIam,
    pub elb: FakeElb,
    pub ec2: FakeEc2,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(seed: &ProviderSeed) -> Self {
        let mut iam = FakeIam::new();
        for group in &seed.groups {
            iam = iam.with_group(group);
        }
        for attachment in &seed.group_attachments {
            iam = iam.with_attachment(&attachment.group, &attachment.policy_arn);
        }
        let mut elb = FakeElb::new();
        for name in &seed.load_balancers {
            elb = elb.with_load_balancer(name);
        }
        Self {
            iam,
            elb,
            ec2: FakeEc2::new(),
        }
    }

    /// Engines for every supported kind, sharing `store` for provider
    /// configs, credentials and references.
    pub fn registry(&self, store: &ResourceStore, policy: SelectionPolicy) -> Registry {
        let mut registry = Registry::new();
        registry.register(
            GroupPolicyAttachmentParameters::KIND,
            engine::<GroupPolicyAttachment, GroupPolicyAttachmentClient<FakeIam>, _>(
                store,
                self.iam.clone(),
                policy,
            ),
        );
        registry.register(
            ElbAttachmentParameters::KIND,
            engine::<ElbAttachment, ElbAttachmentClient<FakeElb>, _>(
                store,
                self.elb.clone(),
                policy,
            ),
        );
        registry.register(
            RouteTableParameters::KIND,
            engine::<RouteTable, RouteTableClient<FakeEc2>, _>(store, self.ec2.clone(), policy),
        );
        registry
    }
}

type Engine<R, C, A> = Reconciler<
    R,
    ProviderConnector<ResourceStore, ResourceStore, CachingFactory<ApiFactory<A>, C>>,
    ResourceStore,
>;

fn engine<R, C, A>(store: &ResourceStore, api: A, policy: SelectionPolicy) -> Engine<R, C, A>
where
    R: Managed,
    A: Clone + Send + Sync + 'static,
    ProviderConnector<ResourceStore, ResourceStore, CachingFactory<ApiFactory<A>, C>>:
        Connector<R>,
{
    Reconciler::new(
        ProviderConnector::new(
            store.clone(),
            store.clone(),
            CachingFactory::new(ApiFactory::new(api)),
        ),
        ReferenceResolver::new(store.clone()).with_policy(policy),
    )
}
