//! End-to-end runs against the simulated platform.

use std::sync::Arc;
use std::time::Duration;

use edgechain_balancer::{ListenerState, StaticCertificateStore};
use edgechain_core::StackConfig;
use edgechain_health::{BoxFuture, HealthChain, ProbeResult, ProbeTarget, Prober};
use edgechain_network::ReachabilityError;
use edgechain_provision::{
    Action, Environment, EnvironmentStatus, ErrorKind, Fault, Operation, Orchestrator, Platform, PlatformError,
    ProvisionError, SimulatedPlatform, Step,
};
use edgechain_state::{ResourceKey, ResourceKind, StateStore, TargetHealthState};
use tokio::sync::watch;

const CERT: &str = "arn:aws:acm:ca-central-1:111122223333:certificate/0b1f1c2e-4d5a-4f7e-9a3b-7c6d5e4f3a2b";

fn config() -> StackConfig {
    let mut config = StackConfig::scaffold("fin-chat", "ca-central-1", "registry.local/fin-chat:v1", CERT);
    config.provisioning.call_timeout = "10s".to_string();
    config
}

struct Harness {
    orchestrator: Orchestrator,
    platform: SimulatedPlatform,
    state: StateStore,
    certificates: StaticCertificateStore,
}

fn harness_with(name: &str, config: StackConfig, state: StateStore, platform: SimulatedPlatform) -> Harness {
    let certificates = StaticCertificateStore::new();
    certificates.insert(CERT);
    let env = Environment::new(name, config, state.clone(), Arc::new(platform.clone()))
        .unwrap()
        .with_certificates(Arc::new(certificates.clone()));
    Harness {
        orchestrator: Orchestrator::new(env),
        platform,
        state,
        certificates,
    }
}

fn harness(config: StackConfig) -> Harness {
    harness_with(
        "prod",
        config,
        StateStore::open_in_memory().unwrap(),
        SimulatedPlatform::new(),
    )
}

fn never_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn key(kind: ResourceKind, name: &str) -> ResourceKey {
    ResourceKey::new(kind, name)
}

#[tokio::test]
async fn apply_provisions_the_whole_chain() {
    let h = harness(config());
    let report = h.orchestrator.apply(never_cancel()).await.unwrap();

    assert_eq!(report.status, EnvironmentStatus::Ready);
    assert!(report.warnings.is_empty());
    assert_eq!(report.plan.count(Action::Create), h.platform.resource_count());
    assert!(h.platform.contains(&key(ResourceKind::LoadBalancer, "internal")));
    assert!(h.platform.contains(&key(ResourceKind::LoadBalancer, "external")));
    assert_eq!(h.platform.count(ResourceKind::Endpoint), 5);

    let outputs: Vec<_> = report.outputs.iter().map(|o| (o.key.as_str(), o.value.as_str())).collect();
    assert_eq!(outputs[0], ("image-uri", "registry.local/fin-chat:v1"));
    assert_eq!(outputs[1], ("external-address", report.deployment.external.dns_name.as_str()));
    assert_eq!(outputs[2], ("external-port", "443"));
    assert_eq!(h.orchestrator.outputs().unwrap().len(), 3);

    let recorded = h.state.list_resources("prod").unwrap();
    assert_eq!(recorded.len(), h.platform.resource_count());
    assert!(recorded.iter().all(|r| r.run_id == report.run_id));
}

#[tokio::test]
async fn reapply_changes_nothing() {
    let h = harness(config());
    h.orchestrator.apply(never_cancel()).await.unwrap();
    let creates = h.platform.calls().len();

    assert!(h.orchestrator.plan().unwrap().is_empty());
    let again = h.orchestrator.apply(never_cancel()).await.unwrap();
    assert!(again.plan.is_empty());
    assert_eq!(h.platform.calls().len(), creates);
}

#[tokio::test]
async fn new_image_replaces_task_and_service_only() {
    let h = harness(config());
    h.orchestrator.apply(never_cancel()).await.unwrap();

    let mut changed = config();
    changed.service.image = "registry.local/fin-chat:v2".to_string();
    let next = harness_with("prod", changed, h.state.clone(), h.platform.clone());
    let report = next.orchestrator.apply(never_cancel()).await.unwrap();

    let replaced: Vec<_> = report.plan.pending().map(|c| (c.action, c.key.kind)).collect();
    assert_eq!(
        replaced,
        vec![
            (Action::Replace, ResourceKind::TaskDefinition),
            (Action::Replace, ResourceKind::Service),
        ]
    );
    let task = h
        .state
        .get_resource("prod", &key(ResourceKind::TaskDefinition, "fin-chat"))
        .unwrap()
        .unwrap();
    assert_eq!(task.physical_id, "fin-chat:2");

    let task_key = key(ResourceKind::TaskDefinition, "fin-chat");
    assert!(h.platform.describe(&task_key, "fin-chat:2").await.unwrap());
    assert!(!h.platform.describe(&task_key, "fin-chat:1").await.unwrap());
    assert_eq!(h.platform.count(ResourceKind::TaskDefinition), 1);
}

fn is_cancelled_in(err: &ProvisionError, expected: Step) -> bool {
    matches!(err, ProvisionError::Step { step, source } if *step == expected && matches!(**source, ProvisionError::Cancelled))
}

#[tokio::test(start_paused = true)]
async fn cancelled_replacement_keeps_the_running_revision() {
    let h = harness(config());
    h.orchestrator.apply(never_cancel()).await.unwrap();
    let before = h.platform.resource_count();
    let task_key = key(ResourceKind::TaskDefinition, "fin-chat");
    let service_before = h.state.get_resource("prod", &key(ResourceKind::Service, "fin-chat")).unwrap().unwrap();

    let mut changed = config();
    changed.service.image = "registry.local/fin-chat:v2".to_string();
    let next = harness_with("prod", changed, h.state.clone(), h.platform.clone());
    h.platform.inject(ResourceKind::Service, Fault::Delay(Duration::from_secs(5)));

    let (tx, rx) = watch::channel(false);
    let (result, _) = tokio::join!(next.orchestrator.apply(rx), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
    });

    assert!(is_cancelled_in(&result.unwrap_err(), Step::Compute));
    assert_eq!(h.platform.resource_count(), before);
    assert!(h.platform.describe(&task_key, "fin-chat:1").await.unwrap());
    assert!(!h.platform.describe(&task_key, "fin-chat:2").await.unwrap());

    let task = h.state.get_resource("prod", &task_key).unwrap().unwrap();
    assert_eq!(task.physical_id, "fin-chat:1");
    let service = h.state.get_resource("prod", &key(ResourceKind::Service, "fin-chat")).unwrap().unwrap();
    assert_eq!(service, service_before);

    h.platform.clear_faults();
    let plan = next.orchestrator.plan().unwrap();
    let pending: Vec<_> = plan.pending().map(|c| (c.action, c.key.kind)).collect();
    assert_eq!(
        pending,
        vec![
            (Action::Replace, ResourceKind::TaskDefinition),
            (Action::Replace, ResourceKind::Service),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_waits_for_endpoints_in_flight() {
    let h = harness(config());
    h.platform.inject(ResourceKind::Endpoint, Fault::Delay(Duration::from_secs(2)));

    let (tx, rx) = watch::channel(false);
    let (result, _) = tokio::join!(h.orchestrator.apply(rx), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
    });

    assert!(is_cancelled_in(&result.unwrap_err(), Step::Endpoints));
    assert_eq!(h.platform.calls_for(ResourceKind::Endpoint, Operation::Create), 5);
    assert_eq!(h.platform.calls_for(ResourceKind::Endpoint, Operation::Delete), 5);
    assert_eq!(h.platform.resource_count(), 0);
    assert!(h.state.list_resources("prod").unwrap().is_empty());
}

#[tokio::test]
async fn one_zone_isolated_tier_fails_at_fabric() {
    let mut config = config();
    config.network.tiers[1].zones = Some(vec!["ca-central-1a".to_string()]);
    let h = harness(config);

    let err = h.orchestrator.apply(never_cancel()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.step(), Some(Step::Fabric));
    assert_eq!(h.platform.resource_count(), 0);
}

#[tokio::test]
async fn missing_certificate_stops_before_the_balancers() {
    let h = harness(config());
    h.certificates.remove(CERT);

    let err = h.orchestrator.apply(never_cancel()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyUnavailable);
    assert_eq!(err.step(), Some(Step::InternalBalancer));
    assert_eq!(err.reference(), Some(CERT));

    assert!(h.platform.count(ResourceKind::Subnet) > 0);
    assert!(h.platform.contains(&key(ResourceKind::Service, "fin-chat")));
    assert_eq!(h.platform.count(ResourceKind::LoadBalancer), 0);
    assert_eq!(h.platform.count(ResourceKind::Listener), 0);
    assert_eq!(h.state.list_resources("prod").unwrap().len(), h.platform.resource_count());
}

#[tokio::test]
async fn health_propagates_task_to_edge() {
    let h = harness(config());
    let report = h.orchestrator.apply(never_cancel()).await.unwrap();
    let deployment = report.deployment;
    let mut chain = HealthChain::new(
        deployment.internal,
        deployment.external,
        deployment.port_chain.internal_port,
        deployment.port_chain.external_port,
    );

    chain.tick(|_| ProbeResult::Healthy);
    let second = chain.tick(|_| ProbeResult::Healthy);
    assert_eq!(second.internal, ListenerState::Healthy);
    assert_ne!(second.external, ListenerState::Healthy);

    let third = chain.tick(|_| ProbeResult::Healthy);
    assert_eq!(third.external, ListenerState::Healthy);
}

#[tokio::test]
async fn missing_endpoint_grant_degrades_instead_of_failing() {
    let mut config = config();
    config.endpoints.allow_from.clear();
    let h = harness(config);

    let report = h.orchestrator.apply(never_cancel()).await.unwrap();
    assert_eq!(report.status, EnvironmentStatus::Degraded);
    assert!(!report.warnings.is_empty());
    assert!(
        report
            .warnings
            .iter()
            .all(|w| matches!(w, ReachabilityError::ConnectionRefused { port: 443, .. }))
    );
    assert!(h.platform.contains(&key(ResourceKind::LoadBalancer, "external")));
}

#[tokio::test(start_paused = true)]
async fn throttling_is_retried() {
    let h = harness(config());
    h.platform.inject(
        ResourceKind::Subnet,
        Fault::Fail {
            times: 2,
            error: PlatformError::Throttled("rate exceeded".into()),
        },
    );

    h.orchestrator.apply(never_cancel()).await.unwrap();
    assert_eq!(h.platform.count(ResourceKind::Subnet), 4);
    assert_eq!(h.platform.calls_for(ResourceKind::Subnet, Operation::Create), 6);
}

#[tokio::test(start_paused = true)]
async fn persistent_throttling_gives_up() {
    let h = harness(config());
    h.platform.inject(
        ResourceKind::Cluster,
        Fault::Fail {
            times: u32::MAX,
            error: PlatformError::NotConsistent("fabric not visible".into()),
        },
    );

    let err = h.orchestrator.apply(never_cancel()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(err.step(), Some(Step::Compute));
    assert_eq!(h.platform.calls_for(ResourceKind::Cluster, Operation::Create), 4);
}

#[tokio::test(start_paused = true)]
async fn slow_call_times_out_without_retry() {
    let h = harness(config());
    h.platform.inject(ResourceKind::Cluster, Fault::Delay(Duration::from_secs(60)));

    let err = h.orchestrator.apply(never_cancel()).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::Step { step: Step::Compute, ref source } if matches!(**source, ProvisionError::Timeout { .. })
    ));
    assert_eq!(h.platform.calls_for(ResourceKind::Cluster, Operation::Create), 1);
    assert!(!h.platform.contains(&key(ResourceKind::Cluster, "fin-chat")));
}

#[tokio::test(start_paused = true)]
async fn partial_certificate_binding_is_not_repeated() {
    let h = harness(config());
    h.platform.inject_for(
        key(ResourceKind::Listener, "internal-443"),
        Fault::Partial(PlatformError::Throttled("response lost".into())),
    );

    let err = h.orchestrator.apply(never_cancel()).await.unwrap_err();
    assert_eq!(err.step(), Some(Step::InternalBalancer));
    assert!(matches!(
        err,
        ProvisionError::Step { ref source, .. } if matches!(**source, ProvisionError::PartialResource { .. })
    ));
    assert_eq!(h.platform.calls_for(ResourceKind::Listener, Operation::Describe), 1);
    assert!(!h.platform.contains(&key(ResourceKind::LoadBalancer, "external")));
}

#[tokio::test(start_paused = true)]
async fn cancel_unwinds_only_this_run() {
    let h = harness(config());
    h.orchestrator.apply(never_cancel()).await.unwrap();
    let before = h.platform.resource_count();

    let mut changed = config();
    changed.service.image = "registry.local/fin-chat:v2".to_string();
    changed.stack.name = "fin-chat-blue".to_string();
    changed.service.name = "fin-chat-blue".to_string();
    let blue = harness_with("blue", changed, h.state.clone(), h.platform.clone());
    h.platform.inject(ResourceKind::Cluster, Fault::Delay(Duration::from_secs(5)));

    let (tx, rx) = watch::channel(false);
    let (result, _) = tokio::join!(blue.orchestrator.apply(rx), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
    });

    let err = result.unwrap_err();
    assert!(matches!(err, ProvisionError::Step { step: Step::Compute, ref source } if matches!(**source, ProvisionError::Cancelled)));
    assert!(h.state.list_resources("blue").unwrap().is_empty());
    assert_eq!(h.platform.resource_count(), before);
    assert!(!h.state.list_resources("prod").unwrap().is_empty());
}

#[tokio::test]
async fn destroy_removes_everything_in_reverse() {
    let h = harness(config());
    h.orchestrator.apply(never_cancel()).await.unwrap();
    let created = h.state.list_resources("prod").unwrap();

    let report = h.orchestrator.destroy().await.unwrap();
    assert_eq!(report.resources, created.len());
    assert_eq!(report.outputs, 3);
    assert_eq!(h.platform.resource_count(), 0);
    assert!(h.state.list_resources("prod").unwrap().is_empty());
    assert!(h.orchestrator.outputs().unwrap().is_empty());

    let deletes: Vec<ResourceKey> = h
        .platform
        .calls()
        .into_iter()
        .filter(|(op, _)| *op == Operation::Delete)
        .map(|(_, k)| k)
        .collect();
    let mut expected: Vec<_> = created.iter().map(|r| r.key.clone()).collect();
    expected.reverse();
    assert_eq!(deletes, expected);

    // Nothing left to do the second time.
    assert_eq!(h.orchestrator.destroy().await.unwrap().resources, 0);
}

#[tokio::test]
async fn environments_share_nothing() {
    let state = StateStore::open_in_memory().unwrap();
    let platform = SimulatedPlatform::new();
    let prod = harness_with("prod", config(), state.clone(), platform.clone());
    let mut staging_config = config();
    staging_config.stack.name = "fin-chat-staging".to_string();
    staging_config.service.name = "fin-chat-staging".to_string();
    let staging = harness_with("staging", staging_config, state.clone(), platform.clone());

    prod.orchestrator.apply(never_cancel()).await.unwrap();
    staging.orchestrator.apply(never_cancel()).await.unwrap();
    assert_eq!(state.list_environments().unwrap(), vec!["prod".to_string(), "staging".to_string()]);

    staging.orchestrator.destroy().await.unwrap();
    assert!(state.list_resources("staging").unwrap().is_empty());
    assert!(prod.orchestrator.plan().unwrap().is_empty());
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    let platform = SimulatedPlatform::new();
    {
        let h = harness_with("prod", config(), StateStore::open(&path).unwrap(), platform.clone());
        h.orchestrator.apply(never_cancel()).await.unwrap();
    }
    let h = harness_with("prod", config(), StateStore::open(&path).unwrap(), platform);
    assert!(h.orchestrator.plan().unwrap().is_empty());
}

struct Healthy;

impl Prober for Healthy {
    fn probe<'a>(&'a self, _target: &'a ProbeTarget) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async { ProbeResult::Healthy })
    }
}

#[tokio::test(start_paused = true)]
async fn monitors_record_target_health() {
    let h = harness(config());
    let report = h.orchestrator.apply(never_cancel()).await.unwrap();
    let monitor = h.orchestrator.monitor(&report.deployment, Arc::new(Healthy)).await;
    assert_eq!(monitor.active_monitors().await.len(), 2);

    tokio::time::sleep(Duration::from_secs(65)).await;
    for tg in report.deployment.internal.target_groups() {
        let records = h.state.list_target_health("prod", &tg.id).unwrap();
        assert_eq!(records.len(), tg.targets.len());
        assert!(records.iter().all(|r| r.state == TargetHealthState::Healthy));
    }
    monitor.stop_all().await;
}
