//! The process-wide defaults tier. Kept in its own binary because it
//! mutates state every test in the process would otherwise see.

use std::time::Duration;

use podlab::defaults::{self, DefaultsContext};
use podlab::testing::{RecordingCluster, RECORDING_CLUSTER_NAME};
use podlab::{Cluster, TestPod, WaitStrategy, WorkloadSpec};

#[tokio::test]
async fn story_thread_context_overrides_the_global_tier() {
    let global = RecordingCluster::new().with_ready_replicas();
    let global_cluster = global.cluster();
    defaults::set_global_cluster_supplier(move || global_cluster.clone());
    defaults::set_global_namespace_name_supplier(|| "it-global".to_string());

    // Nothing on this thread: the global tier answers
    assert!(defaults::has_cluster_configured());
    assert_eq!(defaults::resolve_cluster().name(), RECORDING_CLUSTER_NAME);
    assert_eq!(defaults::resolve_namespace_name(), "it-global");

    let wait = || {
        WaitStrategy::readiness_probe()
            .with_timeout(Duration::from_secs(1))
            .with_poll_interval(Duration::from_millis(10))
    };

    let mut pod = TestPod::deployment(WorkloadSpec::new("web").waiting_for(wait()));
    pod.start().await.unwrap();
    assert_eq!(pod.namespace(), Some("it-global"));
    assert_eq!(global.namespace_creates("it-global"), 1);
    pod.stop().await;

    // A thread context wins over the global one, for the name only
    let local = DefaultsContext::new().with_namespace_name("it-local");
    let guard = local.enter();
    let mut pod = TestPod::deployment(WorkloadSpec::new("web").waiting_for(wait()));
    drop(guard);
    pod.start().await.unwrap();
    assert_eq!(pod.namespace(), Some("it-local"));
    assert_eq!(global.namespace_creates("it-local"), 1);
    pod.stop().await;

    // A child thread sees the global tier too, without any snapshot
    let name = defaults::spawn(|| defaults::resolve_cluster().name().to_string())
        .join()
        .unwrap();
    assert_eq!(name, RECORDING_CLUSTER_NAME);

    defaults::clear_global();
    assert!(!defaults::has_cluster_configured());
    let discovered: Cluster = defaults::resolve_cluster();
    assert_eq!(discovered.name(), podlab::cluster::DISCOVERED_CLUSTER_NAME);
}
