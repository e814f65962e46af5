//! In-memory cluster that records every call, for tests
//!
//! ```ignore
//! let fake = RecordingCluster::new().with_ready_replicas();
//! let mut pod = TestPod::deployment(WorkloadSpec::new("nginx").in_cluster(fake.cluster()));
//! pod.start().await?;
//! assert_eq!(fake.created_kinds(), vec![ResourceKind::Deployment, ResourceKind::Service]);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;

use crate::cluster::{
    Cluster, ClusterClient, ExecCommand, ExecResult, LogOptions, ManagedResource, PortForward,
    ReplicaStatus, ResourceKind, ResourceRef, WorkloadKind,
};
use crate::host::HostAndPort;
use podlab_common::{Error, Result};

/// Name of clusters handed out by [`RecordingCluster::cluster`]
pub const RECORDING_CLUSTER_NAME: &str = "recording";

const FIRST_FORWARD_PORT: u16 = 40000;

/// One client call, in the order it was made
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    /// `namespace_exists`
    NamespaceExists(String),
    /// `create_namespace`
    CreateNamespace(String),
    /// `delete_namespace`
    DeleteNamespace(String),
    /// `create`, recorded before the outcome is known
    Create(ResourceRef),
    /// `delete`, recorded before the outcome is known
    Delete(ResourceRef),
    /// `workload_status`
    WorkloadStatus(String),
    /// `get_service`
    GetService(String),
    /// `pod_logs`
    PodLogs {
        /// Pod selector
        selector: String,
        /// Requested container and window
        options: LogOptions,
    },
    /// `exec`
    Exec {
        /// Pod selector
        selector: String,
        /// What was run
        command: ExecCommand,
    },
    /// `port_forward`
    PortForward {
        /// Pod selector
        selector: String,
        /// Target port
        port: u16,
    },
}

/// How replica status is reported for existing workloads
#[derive(Clone, Copy, Debug, Default)]
enum StatusMode {
    /// Every replica exists, none ready
    #[default]
    NeverReady,
    /// Every replica ready
    Ready,
    /// Fixed counts
    Fixed(ReplicaStatus),
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    namespaces: BTreeSet<String>,
    objects: Vec<(ResourceRef, ManagedResource)>,
    created: Vec<ManagedResource>,
    deleted: Vec<ResourceRef>,
    status: StatusMode,
    fail_create: HashSet<ResourceKind>,
    fail_delete: HashSet<ResourceKind>,
    fail_namespace_deletes: usize,
    logs: Option<String>,
    container_logs: BTreeMap<String, String>,
    exec_results: VecDeque<ExecResult>,
    forwards: u16,
}

impl State {
    fn find(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<&ManagedResource> {
        self.objects
            .iter()
            .find(|(r, _)| r.kind == kind && r.namespace == namespace && r.name == name)
            .map(|(_, o)| o)
    }
}

/// Fake [`ClusterClient`] that keeps objects in memory and records calls.
///
/// Clones share state, so a test keeps one handle for assertions while
/// the pod under test uses another through [`RecordingCluster::cluster`].
#[derive(Clone, Debug, Default)]
pub struct RecordingCluster {
    state: Arc<Mutex<State>>,
}

impl RecordingCluster {
    /// Empty cluster whose workloads never become ready
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every replica of an existing workload as ready
    pub fn with_ready_replicas(self) -> Self {
        self.state().status = StatusMode::Ready;
        self
    }

    /// Report fixed replica counts for existing workloads
    pub fn with_status(self, status: ReplicaStatus) -> Self {
        self.set_status(status);
        self
    }

    /// Namespace that exists before any test code runs
    pub fn with_existing_namespace(self, name: &str) -> Self {
        self.state().namespaces.insert(name.to_string());
        self
    }

    /// Fail every create call for `kind`
    pub fn failing_create(self, kind: ResourceKind) -> Self {
        self.state().fail_create.insert(kind);
        self
    }

    /// Fail every delete call for `kind`
    pub fn failing_delete(self, kind: ResourceKind) -> Self {
        self.state().fail_delete.insert(kind);
        self
    }

    /// Fail the next `times` namespace deletions
    pub fn failing_namespace_deletes(self, times: usize) -> Self {
        self.state().fail_namespace_deletes = times;
        self
    }

    /// Logs of the default container, for any selector
    pub fn with_logs(self, logs: impl Into<String>) -> Self {
        self.state().logs = Some(logs.into());
        self
    }

    /// Logs of a named container, for any selector
    pub fn with_container_logs(self, container: &str, logs: impl Into<String>) -> Self {
        self.state()
            .container_logs
            .insert(container.to_string(), logs.into());
        self
    }

    /// Queue exec outcomes; they are served in order and the last one
    /// repeats. Without any, every command succeeds with no output.
    pub fn with_exec_results(self, results: impl IntoIterator<Item = ExecResult>) -> Self {
        self.state().exec_results.extend(results);
        self
    }

    /// Change the reported replica counts
    pub fn set_status(&self, status: ReplicaStatus) {
        self.state().status = StatusMode::Fixed(status);
    }

    /// Remove an object behind the client's back
    pub fn remove_externally(&self, kind: ResourceKind, namespace: &str, name: &str) {
        self.state()
            .objects
            .retain(|(r, _)| !(r.kind == kind && r.namespace == namespace && r.name == name));
    }

    /// Cluster handle backed by this fake
    pub fn cluster(&self) -> Cluster {
        Cluster::new(RECORDING_CLUSTER_NAME, Arc::new(self.clone()))
    }

    /// Every call so far
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Objects whose create call succeeded, in order
    pub fn created(&self) -> Vec<ManagedResource> {
        self.state().created.clone()
    }

    /// Kinds of objects whose create call succeeded, in order
    pub fn created_kinds(&self) -> Vec<ResourceKind> {
        self.state().created.iter().map(ManagedResource::kind).collect()
    }

    /// Objects whose delete call succeeded, in order
    pub fn deleted(&self) -> Vec<ResourceRef> {
        self.state().deleted.clone()
    }

    /// Objects that currently exist
    pub fn live(&self) -> Vec<ResourceRef> {
        self.state().objects.iter().map(|(r, _)| r.clone()).collect()
    }

    /// Namespaces that currently exist
    pub fn namespaces(&self) -> Vec<String> {
        self.state().namespaces.iter().cloned().collect()
    }

    /// Number of `create_namespace` calls for `name`
    pub fn namespace_creates(&self, name: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::CreateNamespace(n) if n == name))
            .count()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn desired_replicas(object: &ManagedResource) -> i32 {
    let replicas = match object {
        ManagedResource::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas),
        ManagedResource::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas),
        _ => None,
    };
    replicas.unwrap_or(1)
}

#[async_trait]
impl ClusterClient for RecordingCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let mut state = self.state();
        state.calls.push(Call::NamespaceExists(name.to_string()));
        Ok(state.namespaces.contains(name))
    }

    async fn create_namespace(&self, name: &str, _labels: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::CreateNamespace(name.to_string()));
        if !state.namespaces.insert(name.to_string()) {
            return Err(Error::already_exists("Namespace", name));
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::DeleteNamespace(name.to_string()));
        if state.fail_namespace_deletes > 0 {
            state.fail_namespace_deletes -= 1;
            return Err(Error::internal_with_context(
                "delete_namespace",
                format!("injected failure for {}", name),
            ));
        }
        if !state.namespaces.remove(name) {
            return Err(Error::not_found("Namespace", name));
        }
        state.objects.retain(|(r, _)| r.namespace != name);
        Ok(())
    }

    async fn create(&self, resource: &ManagedResource) -> Result<()> {
        let r = resource.resource_ref()?;
        let mut state = self.state();
        state.calls.push(Call::Create(r.clone()));
        if state.fail_create.contains(&r.kind) {
            return Err(Error::internal_with_context(
                "create",
                format!("injected failure for {}", r),
            ));
        }
        if !state.namespaces.contains(&r.namespace) {
            return Err(Error::not_found("Namespace", r.namespace));
        }
        if state.find(r.kind, &r.namespace, &r.name).is_some() {
            return Err(Error::already_exists(r.kind.to_string(), r.name));
        }
        state.objects.push((r, resource.clone()));
        state.created.push(resource.clone());
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Delete(resource.clone()));
        if state.fail_delete.contains(&resource.kind) {
            return Err(Error::internal_with_context(
                "delete",
                format!("injected failure for {}", resource),
            ));
        }
        let before = state.objects.len();
        state.objects.retain(|(r, _)| r != resource);
        if state.objects.len() == before {
            return Err(Error::not_found(resource.kind.to_string(), &resource.name));
        }
        state.deleted.push(resource.clone());
        Ok(())
    }

    async fn workload_status(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaStatus>> {
        let mut state = self.state();
        state.calls.push(Call::WorkloadStatus(name.to_string()));
        let Some(object) = state.find(kind.resource_kind(), namespace, name) else {
            return Ok(None);
        };
        let desired = desired_replicas(object);
        Ok(Some(match state.status {
            StatusMode::NeverReady => ReplicaStatus {
                desired,
                current: desired,
                ready: 0,
            },
            StatusMode::Ready => ReplicaStatus {
                desired,
                current: desired,
                ready: desired,
            },
            StatusMode::Fixed(status) => status,
        }))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let mut state = self.state();
        state.calls.push(Call::GetService(name.to_string()));
        Ok(match state.find(ResourceKind::Service, namespace, name) {
            Some(ManagedResource::Service(svc)) => Some(svc.clone()),
            _ => None,
        })
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        selector: &str,
        options: &LogOptions,
    ) -> Result<Option<String>> {
        let mut state = self.state();
        state.calls.push(Call::PodLogs {
            selector: selector.to_string(),
            options: options.clone(),
        });
        Ok(match &options.container {
            Some(container) => state.container_logs.get(container).cloned(),
            None => state.logs.clone(),
        })
    }

    async fn exec(
        &self,
        namespace: &str,
        selector: &str,
        command: &ExecCommand,
    ) -> Result<ExecResult> {
        let mut state = self.state();
        state.calls.push(Call::Exec {
            selector: selector.to_string(),
            command: command.clone(),
        });
        if !state.namespaces.contains(namespace) {
            return Err(Error::not_found("Namespace", namespace));
        }
        let result = if state.exec_results.len() > 1 {
            state.exec_results.pop_front()
        } else {
            state.exec_results.front().cloned()
        };
        Ok(result.unwrap_or_default())
    }

    async fn node_internal_ip(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn port_forward(&self, _namespace: &str, selector: &str, port: u16) -> Result<PortForward> {
        let mut state = self.state();
        state.calls.push(Call::PortForward {
            selector: selector.to_string(),
            port,
        });
        let local = FIRST_FORWARD_PORT + state.forwards;
        state.forwards += 1;
        Ok(PortForward::detached(HostAndPort::localhost(local)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn config_map(ns: &str, name: &str) -> ManagedResource {
        ManagedResource::ConfigMap(ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn behaves_like_the_api_for_duplicates_and_missing_objects() {
        let fake = RecordingCluster::new().with_existing_namespace("ns");
        let cm = config_map("ns", "a");

        fake.create(&cm).await.unwrap();
        assert!(fake.create(&cm).await.unwrap_err().is_already_exists());
        assert!(fake
            .create(&config_map("missing", "a"))
            .await
            .unwrap_err()
            .is_not_found());

        let r = cm.resource_ref().unwrap();
        fake.delete(&r).await.unwrap();
        assert!(fake.delete(&r).await.unwrap_err().is_not_found());
        assert_eq!(fake.deleted(), vec![r]);
    }

    #[tokio::test]
    async fn exec_results_are_served_in_order_and_the_last_repeats() {
        let failing = ExecResult {
            exit_code: 2,
            stderr: "not yet".to_string(),
            ..Default::default()
        };
        let fake = RecordingCluster::new()
            .with_existing_namespace("ns")
            .with_exec_results([failing.clone(), ExecResult::default()]);
        let cmd = ExecCommand::new(["pg_isready"]);

        assert_eq!(fake.exec("ns", "app=db", &cmd).await.unwrap(), failing);
        assert!(fake.exec("ns", "app=db", &cmd).await.unwrap().is_success());
        assert!(fake.exec("ns", "app=db", &cmd).await.unwrap().is_success());
        assert!(fake.exec("gone", "app=db", &cmd).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn logs_are_kept_per_container() {
        let fake = RecordingCluster::new()
            .with_logs("main output")
            .with_container_logs("proxy", "proxy output");

        let main = fake.pod_logs("ns", "app=web", &LogOptions::default()).await;
        assert_eq!(main.unwrap().as_deref(), Some("main output"));
        let proxy = fake
            .pod_logs("ns", "app=web", &LogOptions::default().container("proxy"))
            .await;
        assert_eq!(proxy.unwrap().as_deref(), Some("proxy output"));
        let other = fake
            .pod_logs("ns", "app=web", &LogOptions::default().container("init"))
            .await;
        assert_eq!(other.unwrap(), None);
    }

    #[tokio::test]
    async fn namespace_delete_failures_are_used_up() {
        let fake = RecordingCluster::new()
            .with_existing_namespace("ns")
            .failing_namespace_deletes(1);
        assert!(fake.delete_namespace("ns").await.is_err());
        assert_eq!(fake.namespaces(), vec!["ns".to_string()]);
        fake.delete_namespace("ns").await.unwrap();
        assert!(fake.namespaces().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_namespace_removes_its_objects() {
        let fake = RecordingCluster::new();
        fake.create_namespace("ns", &BTreeMap::new()).await.unwrap();
        fake.create(&config_map("ns", "a")).await.unwrap();
        fake.delete_namespace("ns").await.unwrap();
        assert!(fake.live().is_empty());
        assert!(fake.namespaces().is_empty());
    }
}
