//! End-to-end lifecycle stories against the recording cluster

use std::sync::Arc;
use std::time::Duration;

use podlab::cluster::{ManagedResource, ReplicaStatus, ResourceKind};
use podlab::testing::{Call, RecordingCluster};
use podlab::{
    PodError, PodState, PropertyContext, StartFailure, TestNamespace, TestPod, TestScope,
    WaitStrategy, WorkloadSpec,
};
use podlab_common::telemetry::{init_logging, LogConfig};

fn init_tracing() {
    let _ = init_logging(LogConfig::default());
}

fn quick_probe() -> WaitStrategy {
    WaitStrategy::readiness_probe()
        .with_timeout(Duration::from_millis(300))
        .with_poll_interval(Duration::from_millis(10))
}

fn postgres(fake: &RecordingCluster, namespace: &str) -> WorkloadSpec {
    WorkloadSpec::new("postgres:16")
        .with_port(5432)
        .with_env("POSTGRES_PASSWORD", "test")
        .with_auxiliary_file("01-schema.sql", "CREATE TABLE orders (id int primary key);")
        .in_namespace(namespace)
        .in_cluster(fake.cluster())
        .waiting_for(quick_probe())
}

fn create_position(calls: &[Call], kind: ResourceKind) -> usize {
    calls
        .iter()
        .position(|c| matches!(c, Call::Create(r) if r.kind == kind))
        .unwrap_or_else(|| panic!("no create call for {kind}"))
}

/// Name of the ConfigMap behind the `init-scripts` volume of a workload
fn mounted_config_map(workload: &ManagedResource) -> String {
    let template = match workload {
        ManagedResource::Deployment(d) => serde_json::to_value(&d.spec.as_ref().unwrap().template),
        ManagedResource::StatefulSet(s) => serde_json::to_value(&s.spec.as_ref().unwrap().template),
        other => panic!("not a workload: {:?}", other.kind()),
    }
    .unwrap();
    let volume = template["spec"]["volumes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|v| v["name"] == "init-scripts")
        .expect("init-scripts volume");
    volume["configMap"]["name"].as_str().unwrap().to_string()
}

// =============================================================================
// Ordering and linkage
// =============================================================================

#[tokio::test]
async fn story_payload_is_created_before_the_workload_that_mounts_it() {
    init_tracing();

    for stateful in [false, true] {
        let fake = RecordingCluster::new().with_ready_replicas();
        let spec = postgres(&fake, "it-ordering");
        let mut pod = if stateful {
            TestPod::stateful_set(spec)
        } else {
            TestPod::deployment(spec)
        };
        pod.start().await.unwrap();

        let calls = fake.calls();
        let workload_kind = pod.kind().resource_kind();
        assert!(
            create_position(&calls, ResourceKind::ConfigMap) < create_position(&calls, workload_kind)
        );
        assert!(create_position(&calls, workload_kind) < create_position(&calls, ResourceKind::Service));
        assert_eq!(
            fake.created_kinds(),
            vec![ResourceKind::ConfigMap, workload_kind, ResourceKind::Service]
        );

        // The mount references the ConfigMap under the exact name it was created with
        let created = fake.created();
        assert_eq!(mounted_config_map(&created[1]), created[0].name());

        pod.stop().await;
    }
}

#[tokio::test]
async fn story_failed_payload_means_no_workload_at_all() {
    init_tracing();
    let fake = RecordingCluster::new().failing_create(ResourceKind::ConfigMap);
    let mut pod = TestPod::deployment(postgres(&fake, "it-payload-fails"));

    let err = pod.start().await.unwrap_err();
    let PodError::StartFailed { created, cause, .. } = &err else {
        panic!("expected StartFailed, got {err}");
    };
    assert!(created.is_empty());
    assert!(matches!(cause, StartFailure::Cluster(_)));
    assert!(!fake
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Create(r) if r.kind == ResourceKind::Deployment)));
    assert!(fake.namespaces().is_empty());
}

// =============================================================================
// Cleanup
// =============================================================================

#[tokio::test]
async fn story_stop_deletes_exactly_what_start_created_in_reverse() {
    init_tracing();
    let fake = RecordingCluster::new().with_ready_replicas();
    let mut pod = TestPod::deployment(postgres(&fake, "it-cleanup"));
    pod.start().await.unwrap();

    let created: Vec<_> = pod.managed_resources().to_vec();
    assert_eq!(created.len(), 3);

    pod.stop().await;
    assert_eq!(pod.state(), PodState::Stopped);
    assert!(pod.managed_resources().is_empty());

    let mut expected = created.clone();
    expected.reverse();
    assert_eq!(fake.deleted(), expected);
    assert!(fake.live().is_empty());
    assert!(fake.namespaces().is_empty());

    // A second stop is a no-op
    let calls = fake.calls().len();
    pod.stop().await;
    assert_eq!(fake.calls().len(), calls);
}

#[tokio::test]
async fn story_readiness_timeout_unwinds_everything() {
    init_tracing();
    let fake = RecordingCluster::new();
    let mut pod = TestPod::stateful_set(postgres(&fake, "it-timeout"));

    let err = pod.start().await.unwrap_err();
    assert!(err.is_readiness_timeout());
    let timeout = err.readiness_timeout().unwrap();
    assert_eq!(timeout.pod, "postgres");
    assert!(timeout.last_state.contains("0/1 ready"), "{}", timeout.last_state);

    let PodError::StartFailed { created, .. } = &err else {
        unreachable!()
    };
    let mut expected = created.clone();
    expected.reverse();
    assert_eq!(fake.deleted(), expected);
    assert!(fake.live().is_empty());
    assert!(fake.namespaces().is_empty());
    assert_eq!(pod.state(), PodState::Failed);
    assert!(pod.managed_resources().is_empty());
}

#[tokio::test]
async fn story_cleanup_failure_does_not_mask_the_start_failure() {
    init_tracing();
    let fake = RecordingCluster::new()
        .failing_create(ResourceKind::Service)
        .failing_delete(ResourceKind::Deployment)
        .with_existing_namespace("it-stuck");
    let mut pod = TestPod::deployment(postgres(&fake, "it-stuck"));

    let err = pod.start().await.unwrap_err();
    let PodError::StartFailed { created, cause, .. } = &err else {
        panic!("expected StartFailed, got {err}");
    };
    assert!(matches!(cause, StartFailure::Cluster(_)));
    assert!(!err.is_readiness_timeout());
    let kinds: Vec<_> = created.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ResourceKind::ConfigMap, ResourceKind::Deployment]);

    // The ConfigMap was still deleted after the Deployment delete failed
    let deleted: Vec<_> = fake.deleted().into_iter().map(|r| r.kind).collect();
    assert_eq!(deleted, vec![ResourceKind::ConfigMap]);
    let live: Vec<_> = fake.live().into_iter().map(|r| r.kind).collect();
    assert_eq!(live, vec![ResourceKind::Deployment]);

    // The namespace pre-existed, so it is left in place
    assert_eq!(fake.namespaces(), vec!["it-stuck".to_string()]);
}

#[tokio::test]
async fn story_workload_deleted_while_waiting_is_a_timeout() {
    init_tracing();
    let fake = RecordingCluster::new();
    let mut pod = TestPod::deployment(
        WorkloadSpec::new("nginx")
            .in_namespace("it-vanish")
            .in_cluster(fake.cluster())
            .waiting_for(
                WaitStrategy::readiness_probe()
                    .with_timeout(Duration::from_secs(30))
                    .with_poll_interval(Duration::from_millis(10)),
            ),
    );

    let remover = fake.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        remover.remove_externally(ResourceKind::Deployment, "it-vanish", "nginx");
    });

    let err = pod.start().await.unwrap_err();
    let timeout = err.readiness_timeout().expect("readiness timeout");
    assert!(timeout.elapsed < Duration::from_secs(30));
    assert!(fake.live().is_empty());
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn story_ready_means_exactly_desired() {
    init_tracing();
    let fake = RecordingCluster::new()
        .with_status(ReplicaStatus {
            desired: 2,
            current: 2,
            ready: 2,
        })
        .with_logs("database system is ready to accept connections\n");
    let mut pod = TestPod::deployment(
        WorkloadSpec::new("web")
            .with_port(8080)
            .with_replicas(2)
            .in_cluster(fake.cluster())
            .waiting_for(
                WaitStrategy::log_message("ready to accept connections")
                    .unwrap()
                    .with_timeout(Duration::from_secs(1))
                    .with_poll_interval(Duration::from_millis(10)),
            ),
    );
    pod.start().await.unwrap();
    assert!(pod.is_ready().await.unwrap());
    assert!(pod.logs().await.unwrap().unwrap().contains("ready to accept"));

    for (ready, expected) in [(1, false), (2, true), (3, false)] {
        fake.set_status(ReplicaStatus {
            desired: 2,
            current: 2,
            ready,
        });
        assert_eq!(pod.is_ready().await.unwrap(), expected, "ready={ready}");
    }

    fake.set_status(ReplicaStatus {
        desired: 2,
        current: 0,
        ready: 0,
    });
    assert!(!pod.is_running().await.unwrap());

    let namespace = pod.namespace().unwrap().to_string();
    fake.remove_externally(ResourceKind::Deployment, &namespace, "web");
    assert!(!pod.is_ready().await.unwrap());
    assert!(!pod.is_running().await.unwrap());

    pod.stop().await;
}

// =============================================================================
// Namespaces and defaults
// =============================================================================

#[tokio::test]
async fn story_namespace_create_is_idempotent() {
    let fake = RecordingCluster::new();
    let ns = TestNamespace::new("it-idempotent", fake.cluster());
    ns.create().await.unwrap();
    ns.create().await.unwrap();
    assert_eq!(fake.namespace_creates("it-idempotent"), 1);
    assert!(ns.is_owned());

    ns.close().await.unwrap();
    ns.close().await.unwrap();
    let deletes = fake
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::DeleteNamespace(_)))
        .count();
    assert_eq!(deletes, 1);
}

#[tokio::test]
async fn story_pods_in_a_scope_share_its_namespace() {
    init_tracing();
    let fake = RecordingCluster::new().with_ready_replicas();
    let shared = Arc::new(TestNamespace::new("it-shared", fake.cluster()));
    let scope = TestScope::new("shared_namespace_story")
        .with_cluster(fake.cluster())
        .with_shared_namespace(Arc::clone(&shared));

    let mut db = TestPod::stateful_set(postgres_without_target().waiting_for(quick_probe()));
    let mut web = TestPod::deployment(
        WorkloadSpec::new("web")
            .with_port(8080)
            .waiting_for(quick_probe()),
    );
    db.start().await.unwrap();
    web.start().await.unwrap();
    assert_eq!(db.namespace(), Some("it-shared"));
    assert_eq!(web.namespace(), Some("it-shared"));
    assert_eq!(fake.namespace_creates("it-shared"), 1);

    let mut props = PropertyContext::new();
    db.publish_properties(&mut props).unwrap();
    web.publish_properties(&mut props).unwrap();
    assert_eq!(
        props.resolve("postgres.internal.host").unwrap(),
        "postgres.it-shared.svc.cluster.local"
    );
    assert_ne!(
        props.resolve("postgres.external.port").unwrap(),
        props.resolve("web.external.port").unwrap()
    );

    web.stop().await;
    db.stop().await;
    assert_eq!(fake.namespaces(), vec!["it-shared".to_string()]);

    scope.close().await;
    assert!(fake.namespaces().is_empty());
}

#[tokio::test]
async fn story_scope_names_namespaces_after_the_test() {
    let fake = RecordingCluster::new().with_ready_replicas();
    let scope = TestScope::new("checkout_flow").with_cluster(fake.cluster());

    let mut pod = TestPod::deployment(WorkloadSpec::new("web").waiting_for(quick_probe()));
    pod.start().await.unwrap();
    let namespace = pod.namespace().unwrap().to_string();
    assert!(namespace.contains("checkout-flow"), "{namespace}");

    pod.stop().await;
    assert!(fake.namespaces().is_empty());
    drop(scope);
}

#[tokio::test]
async fn story_failed_namespace_delete_can_be_retried() {
    init_tracing();
    let fake = RecordingCluster::new()
        .with_ready_replicas()
        .failing_namespace_deletes(1);
    let shared = Arc::new(TestNamespace::new("it-retry", fake.cluster()));
    let scope = TestScope::new("retry_story")
        .with_cluster(fake.cluster())
        .with_shared_namespace(Arc::clone(&shared));

    let mut pod = TestPod::deployment(WorkloadSpec::new("web").waiting_for(quick_probe()));
    pod.start().await.unwrap();
    pod.stop().await;

    // The scope logs the failure; the handle still knows it owns the namespace
    scope.close().await;
    assert_eq!(fake.namespaces(), vec!["it-retry".to_string()]);
    assert!(shared.is_owned());

    shared.close().await.unwrap();
    assert!(fake.namespaces().is_empty());
    let deletes = fake
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::DeleteNamespace(n) if n == "it-retry"))
        .count();
    assert_eq!(deletes, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn story_scope_stays_with_its_test_on_a_multi_thread_runtime() {
    init_tracing();
    let fake = RecordingCluster::new().with_ready_replicas();
    let shared = Arc::new(TestNamespace::new("it-multi-thread", fake.cluster()));
    let scope = TestScope::new("multi_thread_story")
        .with_cluster(fake.cluster())
        .with_shared_namespace(Arc::clone(&shared));

    // Worker threads run other tests' tasks and must not see this scope
    let lookups = (0..8).map(|_| tokio::spawn(async { podlab::defaults::has_cluster_configured() }));
    for seen in futures::future::join_all(lookups).await {
        assert!(!seen.unwrap());
    }

    // A pod built here keeps this test's settings wherever it runs
    let mut pod = TestPod::deployment(WorkloadSpec::new("web").waiting_for(quick_probe()));
    let mut pod = tokio::spawn(async move { pod.start().await.map(|_| pod) })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pod.namespace(), Some("it-multi-thread"));

    pod.stop().await;
    scope.close().await;

    assert!(!podlab::defaults::has_cluster_configured());
    assert!(fake.namespaces().is_empty());
}

fn postgres_without_target() -> WorkloadSpec {
    WorkloadSpec::new("postgres:16")
        .with_port(5432)
        .with_auxiliary_file("01-schema.sql", "CREATE TABLE orders (id int primary key);")
}
