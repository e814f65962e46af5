//! The cluster operations a test pod needs, behind a mockable trait

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

#[cfg(test)]
use mockall::automock;

use crate::error::CommandFailed;
use crate::host::HostAndPort;
use podlab_common::{Error, Result};

/// Kind of a namespaced object a pod creates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Auxiliary config payload
    ConfigMap,
    /// Stateless workload
    Deployment,
    /// Stable-identity workload
    StatefulSet,
    /// Network endpoint
    Service,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Service => "Service",
        };
        f.write_str(s)
    }
}

/// Workload resource kinds with replica status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// Deployment
    Stateless,
    /// StatefulSet
    StableIdentity,
}

impl WorkloadKind {
    /// The backing resource kind
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            WorkloadKind::Stateless => ResourceKind::Deployment,
            WorkloadKind::StableIdentity => ResourceKind::StatefulSet,
        }
    }
}

/// Identity of a created object
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Object kind
    pub kind: ResourceKind,
    /// Namespace the object lives in
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A fully built object ready to be created
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedResource {
    /// Auxiliary config payload
    ConfigMap(ConfigMap),
    /// Stateless workload
    Deployment(Deployment),
    /// Stable-identity workload
    StatefulSet(StatefulSet),
    /// Network endpoint
    Service(Service),
}

impl ManagedResource {
    /// Object kind
    pub fn kind(&self) -> ResourceKind {
        match self {
            ManagedResource::ConfigMap(_) => ResourceKind::ConfigMap,
            ManagedResource::Deployment(_) => ResourceKind::Deployment,
            ManagedResource::StatefulSet(_) => ResourceKind::StatefulSet,
            ManagedResource::Service(_) => ResourceKind::Service,
        }
    }

    /// Object name from metadata
    pub fn name(&self) -> String {
        match self {
            ManagedResource::ConfigMap(r) => r.name_any(),
            ManagedResource::Deployment(r) => r.name_any(),
            ManagedResource::StatefulSet(r) => r.name_any(),
            ManagedResource::Service(r) => r.name_any(),
        }
    }

    /// Object namespace from metadata
    pub fn namespace(&self) -> Option<String> {
        match self {
            ManagedResource::ConfigMap(r) => r.namespace(),
            ManagedResource::Deployment(r) => r.namespace(),
            ManagedResource::StatefulSet(r) => r.namespace(),
            ManagedResource::Service(r) => r.namespace(),
        }
    }

    /// Identity used for later deletion; the namespace must be set
    pub fn resource_ref(&self) -> Result<ResourceRef> {
        let namespace = self.namespace().ok_or_else(|| {
            Error::validation(format!("{} '{}' has no namespace", self.kind(), self.name()))
        })?;
        Ok(ResourceRef {
            kind: self.kind(),
            namespace,
            name: self.name(),
        })
    }
}

/// Replica counts of a workload resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    /// Desired replicas from the spec
    pub desired: i32,
    /// Replicas that currently exist
    pub current: i32,
    /// Replicas passing their readiness probe
    pub ready: i32,
}

impl ReplicaStatus {
    /// At least one replica exists
    pub fn is_running(&self) -> bool {
        self.current > 0
    }

    /// Ready count matches desired count exactly
    pub fn is_ready(&self) -> bool {
        self.ready == self.desired
    }
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ready ({} current)",
            self.ready, self.desired, self.current
        )
    }
}

/// Which logs to read
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Container to read; the pod's only or first container when unset
    pub container: Option<String>,
    /// Only lines written within this window
    pub since: Option<Duration>,
}

impl LogOptions {
    /// Read a specific container
    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = Some(name.into());
        self
    }

    /// Only lines newer than `window`
    pub fn since(mut self, window: Duration) -> Self {
        self.since = Some(window);
        self
    }
}

/// A command to run inside a workload's first running pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecCommand {
    /// Program and arguments
    pub command: Vec<String>,
    /// Target container; the pod's first container when unset
    pub container: Option<String>,
}

impl ExecCommand {
    /// Run `command` in the default container
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            container: None,
        }
    }

    /// Run in `container` instead
    pub fn in_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// The command line joined with spaces
    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

/// Outcome of a finished [`ExecCommand`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Process exit code
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl ExecResult {
    /// Exit code zero
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr, newline separated when both are present
    pub fn output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
            _ => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// `Err` for a non-zero exit code, carrying stderr (stdout when stderr is empty)
    pub fn success(self) -> std::result::Result<Self, CommandFailed> {
        if self.is_success() {
            return Ok(self);
        }
        let output = if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        Err(CommandFailed {
            exit_code: self.exit_code,
            output: output.trim().to_string(),
        })
    }
}

/// A local listener relaying to a pod port; the relay stops on drop
#[derive(Debug)]
pub struct PortForward {
    local: HostAndPort,
    relay: Option<JoinHandle<()>>,
}

impl PortForward {
    /// Forward backed by a running relay task
    pub fn new(local: HostAndPort, relay: JoinHandle<()>) -> Self {
        Self {
            local,
            relay: Some(relay),
        }
    }

    /// Forward without a relay task, for fakes
    pub fn detached(local: HostAndPort) -> Self {
        Self { local, relay: None }
    }

    /// Local address clients connect to
    pub fn local_address(&self) -> &HostAndPort {
        &self.local
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

/// Cluster operations used by namespaces, pods and access strategies
///
/// Create calls are not idempotent: creating an existing object fails with
/// an error for which [`Error::is_already_exists`] is true.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Whether a namespace with this name exists
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Create a namespace
    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Delete a namespace and everything in it
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Create a namespaced object
    async fn create(&self, resource: &ManagedResource) -> Result<()>;

    /// Delete a namespaced object
    async fn delete(&self, resource: &ResourceRef) -> Result<()>;

    /// Replica status of a workload, `None` when it does not exist
    async fn workload_status(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaStatus>>;

    /// Fetch a Service, `None` when it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Logs of the first pod matching `selector`, `None` when no pod matches
    /// or the container has not started
    async fn pod_logs(
        &self,
        namespace: &str,
        selector: &str,
        options: &LogOptions,
    ) -> Result<Option<String>>;

    /// Run a command to completion in the first running pod matching `selector`
    async fn exec(&self, namespace: &str, selector: &str, command: &ExecCommand)
        -> Result<ExecResult>;

    /// First `InternalIP` address reported by any node
    async fn node_internal_ip(&self) -> Result<Option<String>>;

    /// Relay a local port to `port` on the first running pod matching `selector`
    async fn port_forward(&self, namespace: &str, selector: &str, port: u16)
        -> Result<PortForward>;
}
