//! The reconciliation engine.
//!
//! One call to [`Reconciler::reconcile`] is one pass over one resource:
//!
//! ```text
//! Connecting -> Resolving -> Observing -> { Creating | Updating | Deleting | Idle }
//! ```
//!
//! The engine never retries and never locks. The caller guarantees at most
//! one concurrent pass per resource and decides when to run the next one.
//! Conditions only record confirmed transitions; `Creating` and `Deleting`
//! are set *before* the corresponding call so an interrupted pass still shows
//! the in-progress marker.

use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, info, instrument, warn};
use xrm_id::PassId;

use crate::condition::Condition;
use crate::connector::Connector;
use crate::context::PassContext;
use crate::error::{ErrorKind, Phase, ReconcileError};
use crate::external::{Drift, ExternalClient, ExternalObservation};
use crate::reference::{DeferReason, ReferenceResolver, Resolution, ResourceLookup};
use crate::resource::Managed;

/// What a successful pass did to the external system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Nothing to do (absent and being deleted, or never created).
    None,
    /// Observed up to date.
    Observed,
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::None => "none",
            Action::Observed => "observed",
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of a pass.
#[derive(Debug)]
pub enum PassOutcome {
    Synced(Action),
    /// A reference is not ready. Not a failure: run another pass later.
    Deferred { field: String, reason: DeferReason },
    Failed(ReconcileError),
}

impl PassOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, PassOutcome::Synced(_))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, PassOutcome::Deferred { .. })
    }

    pub fn action(&self) -> Option<Action> {
        match self {
            PassOutcome::Synced(action) => Some(*action),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ReconcileError> {
        match self {
            PassOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Classification for anything that is not `Synced`.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PassOutcome::Synced(_) => None,
            PassOutcome::Deferred { .. } => Some(ErrorKind::ReferenceDeferred),
            PassOutcome::Failed(err) => Some(err.kind()),
        }
    }
}

/// Outcome of a pass plus what the caller needs to persist.
#[derive(Debug)]
pub struct PassReport {
    pub pass_id: PassId,
    pub outcome: PassOutcome,
    /// Conditions, observed state or external identity changed.
    pub status_changed: bool,
    /// Desired-state fields were filled (references or late initialization).
    pub spec_changed: bool,
    /// Deletion was requested and the external object is confirmed absent.
    pub removable: bool,
}

impl PassReport {
    fn unchanged(pass_id: PassId, outcome: PassOutcome) -> Self {
        Self {
            pass_id,
            outcome,
            status_changed: false,
            spec_changed: false,
            removable: false,
        }
    }

    pub fn needs_write(&self) -> bool {
        self.status_changed || self.spec_changed
    }
}

#[derive(Debug, Default)]
struct Changes {
    status: bool,
    spec: bool,
    removable: bool,
}

/// Generic engine for resources of type `R`.
pub struct Reconciler<R, C, L> {
    connector: C,
    resolver: ReferenceResolver<L>,
    _resource: PhantomData<fn() -> R>,
}

impl<R, C, L> Reconciler<R, C, L>
where
    R: Managed,
    C: Connector<R>,
    L: ResourceLookup,
{
    pub fn new(connector: C, resolver: ReferenceResolver<L>) -> Self {
        Self {
            connector,
            resolver,
            _resource: PhantomData,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Run one pass over a type-erased resource.
    ///
    /// A resource of another kind fails with
    /// [`ReconcileError::InvalidInput`] and is left untouched.
    pub async fn reconcile(&self, ctx: &PassContext, resource: &mut dyn Managed) -> PassReport {
        let kind = resource.kind();
        match resource.downcast_mut::<R>() {
            Some(cr) => self.reconcile_resource(ctx, cr).await,
            None => PassReport::unchanged(
                ctx.pass_id(),
                PassOutcome::Failed(ReconcileError::InvalidInput(format!(
                    "{kind} is not managed by this reconciler"
                ))),
            ),
        }
    }

    /// Run one pass over a resource of the managed kind.
    #[instrument(
        skip_all,
        fields(kind = cr.kind(), resource = %cr.meta().name, pass = %ctx.pass_id())
    )]
    pub async fn reconcile_resource(&self, ctx: &PassContext, cr: &mut R) -> PassReport {
        let mut changes = Changes::default();

        let outcome = match self.run(ctx, cr, &mut changes).await {
            Ok(outcome) => {
                if outcome.is_synced() {
                    changes.status |= cr.conditions_mut().set(Condition::reconcile_success());
                }
                outcome
            }
            Err(err) => {
                debug!(phase = %err.phase(), error = %err, "Reconciliation pass failed");
                if err.marks_unsynced() {
                    changes.status |= cr
                        .conditions_mut()
                        .set(Condition::reconcile_error(err.to_string()));
                }
                PassOutcome::Failed(err)
            }
        };

        PassReport {
            pass_id: ctx.pass_id(),
            outcome,
            status_changed: changes.status,
            spec_changed: changes.spec,
            removable: changes.removable,
        }
    }

    async fn run(
        &self,
        ctx: &PassContext,
        cr: &mut R,
        changes: &mut Changes,
    ) -> Result<PassOutcome, ReconcileError> {
        let client = self.connector.connect(ctx, cr).await?;

        // Deletion only needs the external identity, and reference targets
        // are often torn down first.
        let deleting = cr.meta().is_deletion_requested();
        if !deleting {
            match self.resolver.resolve(ctx, cr).await? {
                Resolution::Deferred { field, reason } => {
                    return Ok(PassOutcome::Deferred { field, reason });
                }
                Resolution::Resolved { applied } => changes.spec |= applied > 0,
            }
        } else if cr.meta().external_name.is_none() {
            debug!("Deletion requested and no external identity recorded");
            changes.removable = true;
            return Ok(PassOutcome::Synced(Action::None));
        }

        let observation = match ctx.run(Phase::Observe, client.observe(cr)).await? {
            Ok(observation) => observation,
            Err(err) if client.is_not_found(&err) => ExternalObservation::absent(),
            Err(err) => return Err(ReconcileError::ObserveFailed(Box::new(err))),
        };

        debug!(
            exists = observation.exists,
            up_to_date = observation.up_to_date,
            late_initialized = observation.late_initialized,
            "Observed external resource"
        );

        changes.spec |= observation.late_initialized;
        changes.status |= observation.exists;
        if let Some(identity) = observation.identity.as_deref() {
            changes.status |= record_identity(cr, identity);
        }

        match (observation.exists, deleting) {
            (false, true) => {
                debug!("External resource confirmed absent");
                changes.removable = true;
                Ok(PassOutcome::Synced(Action::None))
            }
            (false, false) => self.create(ctx, &client, cr, changes).await,
            (true, true) => self.delete(ctx, &client, cr, changes).await,
            (true, false) if observation.up_to_date => {
                changes.status |= cr.conditions_mut().set(Condition::available());
                Ok(PassOutcome::Synced(Action::Observed))
            }
            (true, false) => self.update(ctx, &client, cr, &observation.drift).await,
        }
    }

    async fn create(
        &self,
        ctx: &PassContext,
        client: &C::Client,
        cr: &mut R,
        changes: &mut Changes,
    ) -> Result<PassOutcome, ReconcileError> {
        changes.status |= cr.conditions_mut().set(Condition::creating());

        let creation = ctx
            .run(Phase::Create, client.create(cr))
            .await?
            .map_err(|err| ReconcileError::CreateFailed(Box::new(err)))?;

        if let Some(identity) = creation.identity.as_deref() {
            changes.status |= record_identity(cr, identity);
        }

        info!(external_name = ?cr.meta().external_name, "Created external resource");
        Ok(PassOutcome::Synced(Action::Created))
    }

    async fn update(
        &self,
        ctx: &PassContext,
        client: &C::Client,
        cr: &mut R,
        drift: &Drift,
    ) -> Result<PassOutcome, ReconcileError> {
        let fields: Vec<&str> = drift.iter().collect();
        debug!(?fields, "Updating drifted fields");

        ctx.run(Phase::Update, client.update(cr, drift))
            .await?
            .map_err(|err| ReconcileError::UpdateFailed(Box::new(err)))?;

        info!("Updated external resource");
        Ok(PassOutcome::Synced(Action::Updated))
    }

    async fn delete(
        &self,
        ctx: &PassContext,
        client: &C::Client,
        cr: &mut R,
        changes: &mut Changes,
    ) -> Result<PassOutcome, ReconcileError> {
        changes.status |= cr.conditions_mut().set(Condition::deleting());

        match ctx.run(Phase::Delete, client.delete(cr)).await? {
            Ok(()) => info!("Deleted external resource"),
            Err(err) if client.is_not_found(&err) => {
                debug!("External resource already absent");
            }
            Err(err) => return Err(ReconcileError::DeleteFailed(Box::new(err))),
        }

        Ok(PassOutcome::Synced(Action::Deleted))
    }
}

/// Record the external identity unless one is already set.
fn record_identity<R: Managed>(cr: &mut R, identity: &str) -> bool {
    let meta = cr.meta_mut();
    match meta.external_name.as_deref() {
        None => {
            meta.external_name = Some(identity.to_string());
            true
        }
        Some(existing) if existing == identity => false,
        Some(existing) => {
            warn!(
                existing,
                reported = identity,
                "External identity is immutable, ignoring reported value"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use tokio::sync::watch;

    use crate::condition::{ConditionStatus, ConditionType};
    use crate::error::StoreError;
    use crate::external::ExternalCreation;
    use crate::reference::{Reference, ReferenceField, Target};
    use crate::resource::{late_init, Observation, Parameters, Resource};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct WidgetParams {
        size: Option<u32>,
        parent_id: Option<String>,
        parent_ref: Reference,
    }

    impl Parameters for WidgetParams {
        const KIND: &'static str = "Widget";

        fn reference_fields(&self) -> Vec<ReferenceField> {
            vec![ReferenceField::external_name(
                "parentId",
                self.parent_id.as_deref(),
                &self.parent_ref,
                "Parent",
            )]
        }

        fn apply_reference(&mut self, path: &str, value: String) -> bool {
            if path == "parentId" {
                self.parent_id = Some(value);
                return true;
            }
            false
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct WidgetObservation {
        size: u32,
    }

    impl Observation for WidgetObservation {}

    type Widget = Resource<WidgetParams, WidgetObservation>;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct GadgetParams;

    impl Parameters for GadgetParams {
        const KIND: &'static str = "Gadget";
    }

    #[derive(Debug, thiserror::Error)]
    enum FakeError {
        #[error("widget not found")]
        NotFound,
        #[error("boom")]
        Boom,
    }

    /// Scripted provider shared by the fake connector and its clients.
    #[derive(Default)]
    struct FakeProvider {
        observe: Mutex<VecDeque<Result<ExternalObservation, FakeError>>>,
        create: Mutex<VecDeque<Result<ExternalCreation, FakeError>>>,
        update: Mutex<VecDeque<Result<(), FakeError>>>,
        delete: Mutex<VecDeque<Result<(), FakeError>>>,
        calls: Mutex<Vec<&'static str>>,
        lifecycle_seen_by_create: Mutex<Option<ConditionType>>,
        drift_seen_by_update: Mutex<Option<Drift>>,
        late_init_size: Option<u32>,
        hang_create: bool,
    }

    impl FakeProvider {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn script_observe(&self, result: Result<ExternalObservation, FakeError>) {
            self.observe.lock().unwrap().push_back(result);
        }

        fn script_create(&self, result: Result<ExternalCreation, FakeError>) {
            self.create.lock().unwrap().push_back(result);
        }

        fn script_delete(&self, result: Result<(), FakeError>) {
            self.delete.lock().unwrap().push_back(result);
        }
    }

    #[derive(Clone)]
    struct FakeClient(Arc<FakeProvider>);

    #[async_trait]
    impl ExternalClient<Widget> for FakeClient {
        type Error = FakeError;

        async fn observe(&self, cr: &mut Widget) -> Result<ExternalObservation, FakeError> {
            self.0.calls.lock().unwrap().push("observe");
            let result = self
                .0
                .observe
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ExternalObservation::absent()));
            if let Ok(obs) = &result {
                if obs.exists {
                    let size = cr.params().size.unwrap_or(1);
                    cr.set_observation(WidgetObservation { size });
                }
            }
            let filled = late_init(&mut cr.params_mut().size, self.0.late_init_size);
            result.map(|obs| {
                let late = obs.late_initialized || filled;
                obs.with_late_init(late)
            })
        }

        async fn create(&self, cr: &mut Widget) -> Result<ExternalCreation, FakeError> {
            self.0.calls.lock().unwrap().push("create");
            *self.0.lifecycle_seen_by_create.lock().unwrap() =
                cr.status.conditions.current_lifecycle();
            if self.0.hang_create {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.0
                .create
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ExternalCreation::with_identity("widget-1")))
        }

        async fn update(&self, _cr: &mut Widget, drift: &Drift) -> Result<(), FakeError> {
            self.0.calls.lock().unwrap().push("update");
            *self.0.drift_seen_by_update.lock().unwrap() = Some(drift.clone());
            self.0.update.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn delete(&self, _cr: &mut Widget) -> Result<(), FakeError> {
            self.0.calls.lock().unwrap().push("delete");
            self.0.delete.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        fn is_not_found(&self, err: &FakeError) -> bool {
            matches!(err, FakeError::NotFound)
        }
    }

    struct FakeConnector {
        provider: Arc<FakeProvider>,
        connects: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Connector<Widget> for FakeConnector {
        type Client = FakeClient;

        async fn connect(
            &self,
            _ctx: &PassContext,
            _cr: &Widget,
        ) -> Result<FakeClient, ReconcileError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ReconcileError::ProviderNotFound {
                    name: "aws".into(),
                    source: StoreError::NotFound {
                        kind: "ProviderConfig",
                        name: "aws".into(),
                    },
                });
            }
            Ok(FakeClient(Arc::clone(&self.provider)))
        }
    }

    #[derive(Default)]
    struct Parents(Vec<Target>);

    #[async_trait]
    impl ResourceLookup for Parents {
        async fn get(&self, kind: &str, name: &str) -> Result<Option<Target>, StoreError> {
            Ok(self
                .0
                .iter()
                .find(|t| t.kind == kind && t.name == name)
                .cloned())
        }

        async fn list(
            &self,
            _kind: &str,
            _labels: &BTreeMap<String, String>,
        ) -> Result<Vec<Target>, StoreError> {
            Ok(Vec::new())
        }
    }

    type TestReconciler = Reconciler<Widget, FakeConnector, Parents>;

    fn reconciler(provider: FakeProvider) -> (TestReconciler, Arc<FakeProvider>) {
        reconciler_with(provider, false, Parents::default())
    }

    fn reconciler_with(
        provider: FakeProvider,
        fail_connect: bool,
        parents: Parents,
    ) -> (TestReconciler, Arc<FakeProvider>) {
        let provider = Arc::new(provider);
        let connector = FakeConnector {
            provider: Arc::clone(&provider),
            connects: AtomicUsize::new(0),
            fail: fail_connect,
        };
        (
            Reconciler::new(connector, ReferenceResolver::new(parents)),
            provider,
        )
    }

    fn widget() -> Widget {
        Resource::new("w", "aws", WidgetParams::default())
    }

    #[tokio::test]
    async fn test_wrong_kind_is_invalid_input_without_side_effects() {
        let (reconciler, provider) = reconciler(FakeProvider::default());
        let mut gadget: Resource<GadgetParams, ()> = Resource::new("g", "aws", GadgetParams);

        let report = reconciler
            .reconcile(&PassContext::new(), &mut gadget)
            .await;

        assert_eq!(report.outcome.kind(), Some(ErrorKind::InvalidInput));
        assert!(!report.needs_write());
        assert!(gadget.status.conditions.is_empty());
        assert_eq!(reconciler.connector().connects.load(Ordering::SeqCst), 0);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_absent_resource_is_created() {
        let (reconciler, provider) = reconciler(FakeProvider::default());
        let mut cr = widget();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.action(), Some(Action::Created));
        assert!(report.status_changed);
        assert_eq!(provider.calls(), vec!["observe", "create"]);
        assert_eq!(
            *provider.lifecycle_seen_by_create.lock().unwrap(),
            Some(ConditionType::Creating)
        );
        assert_eq!(cr.metadata.external_name.as_deref(), Some("widget-1"));
        assert_eq!(cr.status.conditions.is_synced(), Some(true));
    }

    #[tokio::test]
    async fn test_create_then_observe_converges() {
        let (reconciler, provider) = reconciler(FakeProvider::default());
        let mut cr = widget();

        reconciler.reconcile(&PassContext::new(), &mut cr).await;
        provider.script_observe(Ok(ExternalObservation::up_to_date()));
        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.action(), Some(Action::Observed));
        assert!(cr.status.conditions.is_available());
        let creating = cr.status.conditions.get(ConditionType::Creating).unwrap();
        assert_eq!(creating.status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn test_create_failure_keeps_creating() {
        let provider = FakeProvider::default();
        provider.script_create(Err(FakeError::Boom));
        let (reconciler, _provider) = reconciler(provider);
        let mut cr = widget();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.kind(), Some(ErrorKind::CreateFailed));
        assert_eq!(report.outcome.error().unwrap().phase(), Phase::Create);
        assert_eq!(
            cr.status.conditions.current_lifecycle(),
            Some(ConditionType::Creating)
        );
        assert_eq!(cr.status.conditions.is_synced(), Some(false));
        assert_eq!(cr.status.at_provider, WidgetObservation::default());
        assert!(cr.metadata.external_name.is_none());
    }

    #[tokio::test]
    async fn test_up_to_date_sets_available() {
        let provider = FakeProvider::default();
        provider.script_observe(Ok(ExternalObservation::up_to_date().with_identity("widget-9")));
        let (reconciler, provider) = reconciler(provider);
        let mut cr = widget();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert!(report.outcome.is_synced());
        assert!(cr.status.conditions.is_available());
        assert_eq!(cr.metadata.external_name.as_deref(), Some("widget-9"));
        assert_eq!(provider.calls(), vec!["observe"]);
    }

    #[tokio::test]
    async fn test_drift_drives_update_with_drifted_fields() {
        let provider = FakeProvider::default();
        provider.script_observe(Ok(ExternalObservation::drifted(
            ["size"].into_iter().collect(),
        )));
        let (reconciler, provider) = reconciler(provider);
        let mut cr = widget();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.action(), Some(Action::Updated));
        let drift = provider.drift_seen_by_update.lock().unwrap().clone().unwrap();
        assert!(drift.contains("size"));
        assert_eq!(cr.status.conditions.current_lifecycle(), None);
    }

    #[tokio::test]
    async fn test_update_failure_leaves_lifecycle_untouched() {
        let provider = FakeProvider::default();
        provider.script_observe(Ok(ExternalObservation::up_to_date()));
        provider.script_observe(Ok(ExternalObservation::drifted(
            ["size"].into_iter().collect(),
        )));
        provider.update.lock().unwrap().push_back(Err(FakeError::Boom));
        let (reconciler, _provider) = reconciler(provider);
        let mut cr = widget();

        reconciler.reconcile(&PassContext::new(), &mut cr).await;
        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.kind(), Some(ErrorKind::UpdateFailed));
        assert!(cr.status.conditions.is_available());
        assert_eq!(cr.status.conditions.is_synced(), Some(false));
    }

    #[tokio::test]
    async fn test_not_found_observe_is_absent() {
        let provider = FakeProvider::default();
        provider.script_observe(Err(FakeError::NotFound));
        let (reconciler, provider) = reconciler(provider);
        let mut cr = widget();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.action(), Some(Action::Created));
        assert_eq!(provider.calls(), vec!["observe", "create"]);
    }

    #[tokio::test]
    async fn test_observe_error_fails_pass() {
        let provider = FakeProvider::default();
        provider.script_observe(Err(FakeError::Boom));
        let (reconciler, provider) = reconciler(provider);
        let mut cr = widget();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.kind(), Some(ErrorKind::ObserveFailed));
        assert_eq!(provider.calls(), vec!["observe"]);
        assert_eq!(cr.status.conditions.current_lifecycle(), None);
    }

    #[tokio::test]
    async fn test_deletion_without_identity_makes_no_calls() {
        let (reconciler, provider) = reconciler(FakeProvider::default());
        let mut cr = widget();
        cr.metadata.request_deletion();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.action(), Some(Action::None));
        assert!(report.removable);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deletion_ignores_missing_reference_target() {
        let (reconciler, provider) = reconciler(FakeProvider::default());
        let mut cr = widget();
        cr.params_mut().parent_ref = Reference::direct("torn-down");
        cr.metadata.request_deletion();

        for _ in 0..2 {
            let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;
            assert_eq!(report.outcome.action(), Some(Action::None));
            assert!(report.removable);
        }
        assert!(provider.calls().is_empty());
        assert!(cr.params().parent_id.is_none());
    }

    #[tokio::test]
    async fn test_deletion_with_identity_skips_resolution() {
        let provider = FakeProvider::default();
        provider.script_observe(Ok(ExternalObservation::up_to_date()));
        let (reconciler, provider) = reconciler(provider);
        let mut cr = widget();
        cr.params_mut().parent_ref = Reference::direct("torn-down");
        cr.metadata.external_name = Some("widget-1".into());
        cr.metadata.request_deletion();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.action(), Some(Action::Deleted));
        assert_eq!(provider.calls(), vec!["observe", "delete"]);
    }

    #[tokio::test]
    async fn test_deletion_of_existing_resource() {
        let provider = FakeProvider::default();
        provider.script_observe(Ok(ExternalObservation::up_to_date()));
        let (reconciler, provider) = reconciler(provider);
        let mut cr = widget();
        cr.metadata.external_name = Some("widget-1".into());
        cr.metadata.request_deletion();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;
        assert_eq!(report.outcome.action(), Some(Action::Deleted));
        assert!(!report.removable);
        assert_eq!(
            cr.status.conditions.current_lifecycle(),
            Some(ConditionType::Deleting)
        );

        // Next pass: gone.
        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;
        assert!(report.removable);
        assert_eq!(provider.calls(), vec!["observe", "delete", "observe"]);
    }

    #[tokio::test]
    async fn test_delete_twice_on_absent_object_succeeds() {
        let provider = FakeProvider::default();
        for _ in 0..2 {
            provider.script_observe(Ok(ExternalObservation::up_to_date()));
            provider.script_delete(Err(FakeError::NotFound));
        }
        let (reconciler, _provider) = reconciler(provider);
        let mut cr = widget();
        cr.metadata.external_name = Some("widget-1".into());
        cr.metadata.request_deletion();

        for _ in 0..2 {
            let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;
            assert_eq!(report.outcome.action(), Some(Action::Deleted));
        }
    }

    #[tokio::test]
    async fn test_delete_failure() {
        let provider = FakeProvider::default();
        provider.script_observe(Ok(ExternalObservation::up_to_date()));
        provider.script_delete(Err(FakeError::Boom));
        let (reconciler, _provider) = reconciler(provider);
        let mut cr = widget();
        cr.metadata.external_name = Some("widget-1".into());
        cr.metadata.request_deletion();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;
        assert_eq!(report.outcome.kind(), Some(ErrorKind::DeleteFailed));
        assert_eq!(
            cr.status.conditions.current_lifecycle(),
            Some(ConditionType::Deleting)
        );
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_status_untouched() {
        let (reconciler, provider) =
            reconciler_with(FakeProvider::default(), true, Parents::default());
        let mut cr = widget();
        cr.status.conditions.set(Condition::available());
        let before = cr.status.conditions.clone();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.kind(), Some(ErrorKind::ProviderNotFound));
        assert!(!report.needs_write());
        assert_eq!(cr.status.conditions, before);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_reference_mutates_nothing() {
        let (reconciler, provider) =
            reconciler_with(FakeProvider::default(), false, Parents::default());
        let mut cr = widget();
        cr.params_mut().parent_ref = Reference::direct("p");

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert!(report.outcome.is_deferred());
        assert_eq!(report.outcome.kind(), Some(ErrorKind::ReferenceDeferred));
        assert!(!report.needs_write());
        assert!(cr.status.conditions.is_empty());
        assert_eq!(cr.status.at_provider, WidgetObservation::default());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resolved_reference_marks_spec_changed() {
        let parents = Parents(vec![Target {
            kind: "Parent".into(),
            name: "p".into(),
            labels: BTreeMap::new(),
            external_name: Some("parent-7".into()),
            attributes: BTreeMap::new(),
        }]);
        let (reconciler, _provider) = reconciler_with(FakeProvider::default(), false, parents);
        let mut cr = widget();
        cr.params_mut().parent_ref = Reference::direct("p");

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert!(report.spec_changed);
        assert_eq!(cr.params().parent_id.as_deref(), Some("parent-7"));
    }

    #[tokio::test]
    async fn test_late_init_triggers_write_back_without_changing_outcome() {
        let provider = FakeProvider {
            late_init_size: Some(3),
            ..Default::default()
        };
        provider.script_observe(Ok(ExternalObservation::up_to_date()));
        let (reconciler, _provider) = reconciler(provider);
        let mut cr = widget();

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(report.outcome.action(), Some(Action::Observed));
        assert!(report.spec_changed);
        assert_eq!(cr.params().size, Some(3));
    }

    #[tokio::test]
    async fn test_late_init_never_overwrites_explicit_field() {
        let provider = FakeProvider {
            late_init_size: Some(3),
            ..Default::default()
        };
        provider.script_observe(Ok(ExternalObservation::up_to_date()));
        let (reconciler, _provider) = reconciler(provider);
        let mut cr = widget();
        cr.params_mut().size = Some(8);

        let report = reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert!(!report.spec_changed);
        assert_eq!(cr.params().size, Some(8));
    }

    #[tokio::test]
    async fn test_cancelled_create_reports_cancelled() {
        let provider = FakeProvider {
            hang_create: true,
            ..Default::default()
        };
        let (reconciler, _provider) = reconciler(provider);
        let (tx, rx) = watch::channel(false);
        let ctx = PassContext::new().with_cancel(rx);
        let mut cr = widget();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let (report, ()) = tokio::join!(reconciler.reconcile(&ctx, &mut cr), cancel);

        assert_eq!(report.outcome.kind(), Some(ErrorKind::Cancelled));
        assert!(cr.metadata.external_name.is_none());
        assert_eq!(cr.status.conditions.is_synced(), None);
        assert_eq!(
            cr.status.conditions.current_lifecycle(),
            Some(ConditionType::Creating)
        );
    }

    #[tokio::test]
    async fn test_identity_is_never_reassigned() {
        let provider = FakeProvider::default();
        provider.script_observe(Ok(ExternalObservation::up_to_date().with_identity("other")));
        let (reconciler, _provider) = reconciler(provider);
        let mut cr = widget();
        cr.metadata.external_name = Some("widget-1".into());

        reconciler.reconcile(&PassContext::new(), &mut cr).await;

        assert_eq!(cr.metadata.external_name.as_deref(), Some("widget-1"));
    }
}
