//! Scheduler rounds against the in-memory provider APIs.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use xrm_controller::manifest::{Manifest, ProviderSeed};
use xrm_controller::registry::{KindReconciler, Providers, Registry};
use xrm_controller::scheduler::{Scheduler, SchedulerConfig, TickStats};
use xrm_controller::store::{ResourceKey, ResourceStore};
use xrm_kinds::ec2::Route;
use xrm_kinds::{
    ApiError, GroupPolicyAttachment, GroupPolicyAttachmentParameters, RouteTable,
    RouteTableParameters,
};
use xrm_kinds::{ElbAttachment, ElbAttachmentParameters};
use xrm_reconcile::{
    Managed, PassContext, PassReport, ProviderConfig, Reference, Resource, SelectionPolicy,
    Target,
};
use xrm_testing::init_test_tracing;

const POLICY: &str = "arn:aws:iam::aws:policy/ReadOnlyAccess";

fn config() -> SchedulerConfig {
    SchedulerConfig {
        interval: Duration::from_millis(10),
        pass_timeout: Duration::from_secs(5),
        max_concurrency: 4,
        backoff_base: Duration::from_secs(1),
        backoff_max: Duration::from_secs(8),
    }
}

fn store() -> ResourceStore {
    let store = ResourceStore::new();
    store.insert_provider(ProviderConfig {
        name: "aws".into(),
        region: "us-east-1".into(),
        endpoint: None,
        use_ambient_identity: true,
        credentials: None,
    });
    store
}

fn attachment(name: &str, group: &str) -> Box<GroupPolicyAttachment> {
    Box::new(Resource::new(
        name,
        "aws",
        GroupPolicyAttachmentParameters {
            group_name: Some(group.into()),
            group_name_ref: Reference::None,
            policy_arn: POLICY.into(),
        },
    ))
}

fn route_table() -> Box<RouteTable> {
    Box::new(Resource::new(
        "public",
        "aws",
        RouteTableParameters {
            vpc_id_ref: Reference::selector([("tier", "main")]),
            routes: vec![Route {
                destination_cidr_block: "0.0.0.0/0".into(),
                gateway_id: Some("igw-1".into()),
                gateway_id_ref: Reference::None,
            }],
            ..Default::default()
        },
    ))
}

fn scheduler(store: &ResourceStore, providers: &Providers, config: SchedulerConfig) -> Scheduler {
    let registry = providers.registry(store, SelectionPolicy::Lenient);
    Scheduler::new(store.clone(), registry, config)
}

fn is_available(store: &ResourceStore, key: &ResourceKey) -> bool {
    store
        .with_resource(key, |r| r.conditions().is_available())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_rounds_converge_resources() {
    init_test_tracing();
    let providers = Providers::seeded(&ProviderSeed {
        groups: vec!["readers".into()],
        ..Default::default()
    });
    let store = store();
    let key = store.insert(attachment("readers-ro", "readers"));
    let scheduler = scheduler(&store, &providers, config());

    let stats = scheduler.run_once().await;
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.synced, 1);
    assert!(providers.iam.is_attached("readers", POLICY));
    assert!(!is_available(&store, &key));

    scheduler.run_once().await;
    assert!(is_available(&store, &key));
    assert_eq!(
        store.snapshot(&key).unwrap().external_name.as_deref(),
        Some(POLICY)
    );
    assert_eq!(providers.iam.call_count("attach"), 1);
}

#[tokio::test]
async fn test_deleted_resource_is_released() {
    let providers = Providers::seeded(&ProviderSeed {
        groups: vec!["readers".into()],
        ..Default::default()
    });
    let store = store();
    let key = store.insert(attachment("readers-ro", "readers"));
    let scheduler = scheduler(&store, &providers, config());
    scheduler.run_once().await;

    assert!(store.request_deletion(&key));
    let stats = scheduler.run_once().await;
    assert_eq!(stats.synced, 1);
    assert!(!providers.iam.is_attached("readers", POLICY));
    assert!(store.contains(&key));

    let stats = scheduler.run_once().await;
    assert_eq!(stats.removed, 1);
    assert!(!store.contains(&key));
    assert_eq!(scheduler.run_once().await, TickStats::default());
}

#[tokio::test(start_paused = true)]
async fn test_failures_back_off_until_success() {
    let providers = Providers::seeded(&ProviderSeed {
        groups: vec!["readers".into()],
        ..Default::default()
    });
    providers
        .iam
        .inject_failure("attach", ApiError::Request("throttled".into()));
    let store = store();
    let key = store.insert(attachment("readers-ro", "readers"));
    let scheduler = scheduler(&store, &providers, config());

    assert_eq!(scheduler.run_once().await.failed, 1);
    assert_eq!(scheduler.failures(&key), 1);

    // Still inside the first one-second delay.
    assert_eq!(scheduler.run_once().await.dispatched, 0);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(scheduler.run_once().await.failed, 1);
    assert_eq!(scheduler.failures(&key), 2);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(scheduler.run_once().await.dispatched, 0);

    providers.iam.heal("attach");
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(scheduler.run_once().await.synced, 1);
    assert_eq!(scheduler.failures(&key), 0);
}

#[tokio::test]
async fn test_deferral_is_not_a_failure() {
    let providers = Providers::new();
    let store = store();
    let key = store.insert(route_table());
    let scheduler = scheduler(&store, &providers, config());

    let stats = scheduler.run_once().await;
    assert_eq!(stats.deferred, 1);
    assert_eq!(scheduler.failures(&key), 0);
    assert_eq!(providers.ec2.table_count(), 0);

    store.import(Target {
        kind: "Vpc".into(),
        name: "main".into(),
        labels: [("tier".to_string(), "main".to_string())].into_iter().collect(),
        external_name: Some("vpc-0a1b".into()),
        attributes: Default::default(),
    });

    assert_eq!(scheduler.run_once().await.synced, 1);
    assert_eq!(providers.ec2.table_count(), 1);
    scheduler.run_once().await;
    scheduler.run_once().await;
    assert!(is_available(&store, &key));
}

#[tokio::test]
async fn test_references_read_other_managed_resources() {
    let providers = Providers::seeded(&ProviderSeed {
        groups: vec!["readers".into()],
        ..Default::default()
    });
    let store = store();
    store.import(Target {
        kind: "Group".into(),
        name: "readers-group".into(),
        labels: Default::default(),
        external_name: Some("readers".into()),
        attributes: Default::default(),
    });
    let mut referencing = attachment("by-ref", "unused");
    referencing.spec.for_provider.group_name = None;
    referencing.spec.for_provider.group_name_ref = Reference::direct("readers-group");
    let key = store.insert(referencing);
    let scheduler = scheduler(&store, &providers, config());

    scheduler.run_once().await;
    scheduler.run_once().await;

    assert!(is_available(&store, &key));
    assert!(providers.iam.is_attached("readers", POLICY));
}

#[tokio::test]
async fn test_concurrency_limit_spreads_work_over_rounds() {
    let providers = Providers::seeded(&ProviderSeed {
        groups: vec!["a".into(), "b".into(), "c".into()],
        ..Default::default()
    });
    let store = store();
    for group in ["a", "b", "c"] {
        store.insert(attachment(&format!("{group}-ro"), group));
    }
    let scheduler = scheduler(
        &store,
        &providers,
        SchedulerConfig {
            max_concurrency: 2,
            ..config()
        },
    );

    assert_eq!(scheduler.run_once().await.dispatched, 2);
    assert_eq!(scheduler.run_once().await.dispatched, 2);
    assert_eq!(scheduler.in_flight(), 0);
    assert_eq!(providers.iam.call_count("attach"), 3);
}

struct Crashing;

#[async_trait]
impl KindReconciler for Crashing {
    async fn run_pass(&self, _ctx: &PassContext, resource: &mut dyn Managed) -> PassReport {
        resource.meta_mut().external_name = Some("half-done".into());
        panic!("reconciler bug");
    }
}

#[tokio::test]
async fn test_panicking_pass_does_not_strand_resource() {
    let store = store();
    let key = store.insert(Box::new(ElbAttachment::new(
        "web-1",
        "aws",
        ElbAttachmentParameters {
            elb_name: "web".into(),
            instance_id: "i-1".into(),
        },
    )));
    let mut registry = Registry::new();
    registry.register("ElbAttachment", Crashing);
    let scheduler = Scheduler::new(store.clone(), registry, config());

    for _ in 0..2 {
        let stats = scheduler.run_once().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 0);
    }
    assert_eq!(scheduler.in_flight(), 0);
    assert_eq!(
        store.snapshot(&key).unwrap().external_name.as_deref(),
        Some("half-done")
    );
}

#[tokio::test]
async fn test_run_reconciles_until_shutdown() {
    let manifest = Manifest::parse(
        r#"{
            "providers": [ { "name": "aws", "region": "us-east-1", "useAmbientIdentity": true } ],
            "resources": [
                {
                    "kind": "ElbAttachment",
                    "metadata": { "name": "web-1" },
                    "spec": { "providerConfigRef": "aws", "forProvider": { "elbName": "web", "instanceId": "i-1" } }
                }
            ],
            "seed": { "loadBalancers": ["web"] }
        }"#,
    )
    .unwrap();
    let providers = Providers::seeded(&manifest.seed);
    let store = ResourceStore::new();
    manifest.populate(&store);
    let key = ResourceKey::new("ElbAttachment", "web-1");
    let scheduler = scheduler(&store, &providers, config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while !is_available(&store, &key) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("attachment becomes available");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler stops")
        .unwrap();
    assert_eq!(providers.elb.instances("web"), vec!["i-1"]);
}
