//! Cluster handle: a client, a name, and how to reach workloads from outside

mod access;
mod client;
mod kube_client;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

pub use access::{AccessStrategy, EndpointTarget, ExternalEndpoint, DEFAULT_LOAD_BALANCER_TIMEOUT};
#[cfg(test)]
pub use client::MockClusterClient;
pub use client::{
    ClusterClient, ExecCommand, ExecResult, LogOptions, ManagedResource, PortForward,
    ReplicaStatus, ResourceKind, ResourceRef, WorkloadKind,
};
pub use kube_client::KubeClusterClient;

use podlab_common::config::PodlabConfig;

/// Name given to clusters found through auto-discovery
pub const DISCOVERED_CLUSTER_NAME: &str = "discovered";

/// A cluster workloads can be started in
#[derive(Clone)]
pub struct Cluster {
    name: String,
    client: Arc<dyn ClusterClient>,
    access: AccessStrategy,
}

impl Cluster {
    /// Cluster using `client`, reached through port-forwarding
    pub fn new(name: impl Into<String>, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            name: name.into(),
            client,
            access: AccessStrategy::default(),
        }
    }

    /// Use a different external access strategy
    pub fn with_access(mut self, access: AccessStrategy) -> Self {
        self.access = access;
        self
    }

    /// Cluster from the ambient environment (`PODLAB_*` variables, then
    /// kube's kubeconfig inference). Never fails: invalid settings are
    /// logged and defaults used, and connection problems surface on first
    /// use.
    pub fn discover() -> Self {
        let config = PodlabConfig::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "ignoring invalid podlab environment configuration");
            PodlabConfig::default()
        });
        Self::from_config(DISCOVERED_CLUSTER_NAME, config)
    }

    /// Cluster from an explicit configuration
    pub fn from_config(name: impl Into<String>, config: PodlabConfig) -> Self {
        let access = AccessStrategy::from_config(&config);
        Self::new(name, Arc::new(KubeClusterClient::lazy(config))).with_access(access)
    }

    /// Cluster from a kubeconfig file, other settings from the environment
    pub fn from_kubeconfig(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut config = PodlabConfig::from_env().unwrap_or_default();
        config.kubeconfig = Some(path.clone());
        Self::from_config(path.display().to_string(), config)
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// API client
    pub fn client(&self) -> &dyn ClusterClient {
        self.client.as_ref()
    }

    /// External access strategy
    pub fn access(&self) -> &AccessStrategy {
        &self.access
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}
