//! The pod lifecycle: start in dependency order, wait, stop in reverse
//!
//! ```text
//! Unstarted ──start──▶ Starting ──ready──▶ Running ──stop──▶ Stopped
//!                          │
//!                          └──error──▶ Failed (everything created is gone)
//! ```
//!
//! `start()` creates, strictly one after another: the namespace (if this
//! pod owns it), the auxiliary ConfigMap, the workload, and the endpoint
//! Service. The workload builder only accepts an [`AuxiliaryBinding`],
//! and for a spec with a payload that binding can only come from a
//! ConfigMap whose create call has already succeeded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::{
    Cluster, EndpointTarget, ExecCommand, ExecResult, ExternalEndpoint, LogOptions,
    ReplicaStatus, ResourceRef, WorkloadKind,
};
use crate::defaults::{self, DefaultsContext};
use crate::error::{PodError, StartFailure};
use crate::host::HostAndPort;
use crate::namespace::{self, TestNamespace};
use crate::properties::PropertyContext;
use crate::wait::WaitTarget;
use crate::workload::{
    AuxiliaryBinding, BuildContext, ManagedResourceSet, NamespaceTarget, StableIdentity,
    Stateless, WorkloadShape, WorkloadSpec,
};
use podlab_common::{Error, Result};

/// Lifecycle state of a [`TestPod`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodState {
    /// Nothing created yet
    Unstarted,
    /// `start()` is creating resources or waiting for readiness
    Starting,
    /// Ready and reachable
    Running,
    /// The last `start()` failed; its resources were removed
    Failed,
    /// `stop()` removed everything
    Stopped,
}

/// One workload under test and everything created for it
pub struct TestPod {
    spec: WorkloadSpec,
    shape: Box<dyn WorkloadShape>,
    defaults: DefaultsContext,
    state: PodState,
    active: Option<Active>,
}

/// What exists in the cluster while the pod is started
struct Active {
    cluster: Cluster,
    namespace: Arc<TestNamespace>,
    owns_namespace: bool,
    resources: ManagedResourceSet,
    external: Option<ExternalEndpoint>,
}

impl Active {
    /// Drop the relay, delete resources in reverse, then the namespace if
    /// this pod brought it. Errors are logged only.
    async fn teardown(mut self, pod: &str) {
        self.external.take();
        self.resources.unwind(self.cluster.client(), pod).await;
        if self.owns_namespace {
            if let Err(e) = self.namespace.close().await {
                warn!(pod = %pod, namespace = %self.namespace.name(), error = %e, "failed to delete namespace");
            }
        }
    }
}

impl TestPod {
    /// Stateless pod (Deployment behind a ClusterIP Service)
    pub fn deployment(spec: WorkloadSpec) -> Self {
        Self::with_shape(spec, Box::new(Stateless))
    }

    /// Stable-identity pod (StatefulSet behind a headless Service)
    pub fn stateful_set(spec: WorkloadSpec) -> Self {
        Self::with_shape(spec, Box::new(StableIdentity))
    }

    /// Pod built by a custom shape. Captures the calling thread's defaults.
    pub fn with_shape(spec: WorkloadSpec, shape: Box<dyn WorkloadShape>) -> Self {
        Self {
            spec,
            shape,
            defaults: defaults::snapshot(),
            state: PodState::Unstarted,
            active: None,
        }
    }

    /// Resolve cluster and namespace through `defaults` instead of the
    /// context captured at construction
    pub fn with_defaults(mut self, defaults: DefaultsContext) -> Self {
        self.defaults = defaults;
        self
    }

    /// Pod name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The spec this pod runs
    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    /// Workload kind
    pub fn kind(&self) -> WorkloadKind {
        self.shape.kind()
    }

    /// Lifecycle state
    pub fn state(&self) -> PodState {
        self.state
    }

    /// Namespace name while started
    pub fn namespace(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.namespace.name())
    }

    /// Resources created so far, in creation order
    pub fn managed_resources(&self) -> &[ResourceRef] {
        self.active
            .as_ref()
            .map(|a| a.resources.as_slice())
            .unwrap_or_default()
    }

    /// Create everything and wait until the workload is ready.
    ///
    /// No-op when already running. On failure every resource created by
    /// this call has been deleted again before the error is returned.
    pub async fn start(&mut self) -> std::result::Result<(), PodError> {
        if self.state == PodState::Running {
            return Ok(());
        }
        self.check_spec()?;
        self.state = PodState::Starting;

        let (namespace, owns_namespace) = self.resolve_namespace();
        info!(
            pod = %self.spec.name,
            kind = %self.shape.kind().resource_kind(),
            namespace = %namespace.name(),
            cluster = %namespace.cluster().name(),
            "starting pod"
        );
        if let Err(e) = namespace.create().await {
            self.state = PodState::Failed;
            return Err(PodError::StartFailed {
                pod: self.spec.name.clone(),
                created: Vec::new(),
                cause: StartFailure::Cluster(e),
            });
        }

        let mut active = Active {
            cluster: namespace.cluster().clone(),
            namespace,
            owns_namespace,
            resources: ManagedResourceSet::new(),
            external: None,
        };

        match self.create_and_wait(&mut active).await {
            Ok(elapsed) => {
                info!(
                    pod = %self.spec.name,
                    resources = active.resources.len(),
                    ready_ms = elapsed.as_millis() as u64,
                    "pod running"
                );
                self.active = Some(active);
                self.state = PodState::Running;
                Ok(())
            }
            Err(cause) => {
                warn!(pod = %self.spec.name, error = %cause, "start failed, removing created resources");
                let created = active.resources.as_slice().to_vec();
                active.teardown(&self.spec.name).await;
                self.state = PodState::Failed;
                Err(PodError::StartFailed {
                    pod: self.spec.name.clone(),
                    created,
                    cause,
                })
            }
        }
    }

    /// Delete everything `start()` created, in reverse order.
    ///
    /// Idempotent. Deletion errors are logged, never returned.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            if self.state == PodState::Failed {
                self.state = PodState::Stopped;
            }
            return;
        };
        info!(pod = %self.spec.name, namespace = %active.namespace.name(), "stopping pod");
        active.teardown(&self.spec.name).await;
        self.state = PodState::Stopped;
    }

    /// At least one instance exists. `false` before start or when the
    /// workload is gone.
    pub async fn is_running(&self) -> std::result::Result<bool, PodError> {
        Ok(self
            .replica_status()
            .await?
            .is_some_and(|s| s.is_running()))
    }

    /// Ready instances equal desired instances. `false` before start or
    /// when the workload is gone.
    pub async fn is_ready(&self) -> std::result::Result<bool, PodError> {
        Ok(self.replica_status().await?.is_some_and(|s| s.is_ready()))
    }

    async fn replica_status(&self) -> Result<Option<ReplicaStatus>> {
        let Some(active) = &self.active else {
            return Ok(None);
        };
        active
            .cluster
            .client()
            .workload_status(self.shape.kind(), active.namespace.name(), &self.spec.name)
            .await
    }

    /// In-cluster DNS name of the endpoint Service
    pub fn internal_host(&self) -> std::result::Result<String, PodError> {
        let active = self.require_active()?;
        Ok(format!(
            "{}.{}.svc.cluster.local",
            self.spec.name,
            active.namespace.name()
        ))
    }

    /// In-cluster port (the primary container port)
    pub fn internal_port(&self) -> u16 {
        self.spec.container.primary_port()
    }

    /// In-cluster address of the primary port
    pub fn internal_address(&self) -> std::result::Result<HostAndPort, PodError> {
        Ok(HostAndPort::new(self.internal_host()?, self.internal_port()))
    }

    /// Address of the primary port reachable from the test process
    pub fn external_address(&self) -> std::result::Result<HostAndPort, PodError> {
        self.require_active()?
            .external
            .as_ref()
            .map(|e| e.address().clone())
            .ok_or_else(|| PodError::NotStarted {
                pod: self.spec.name.clone(),
            })
    }

    /// Logs of the first pod matching the workload's selector
    pub async fn logs(&self) -> std::result::Result<Option<String>, PodError> {
        self.logs_with(&LogOptions::default()).await
    }

    /// Logs of one container, or only recent lines
    ///
    /// ```ignore
    /// let recent = pod.logs_with(&LogOptions::default().since(Duration::from_secs(30))).await?;
    /// let proxy = pod.logs_with(&LogOptions::default().container("envoy")).await?;
    /// ```
    pub async fn logs_with(
        &self,
        options: &LogOptions,
    ) -> std::result::Result<Option<String>, PodError> {
        let active = self.require_active()?;
        Ok(active
            .cluster
            .client()
            .pod_logs(active.namespace.name(), &self.spec.selector(), options)
            .await?)
    }

    /// Run a command in the main container of the first running pod.
    /// A non-zero exit is a normal result; see [`ExecResult::success`].
    pub async fn exec<I, S>(&self, command: I) -> std::result::Result<ExecResult, PodError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_command(&ExecCommand::new(command).in_container(self.spec.name.clone()))
            .await
    }

    /// Run a command, possibly in a sidecar
    pub async fn exec_command(
        &self,
        command: &ExecCommand,
    ) -> std::result::Result<ExecResult, PodError> {
        let active = self.require_active()?;
        if command.command.is_empty() {
            return Err(PodError::Cluster(Error::validation_for_field(
                "command",
                "command must not be empty",
            )));
        }
        Ok(active
            .cluster
            .client()
            .exec(active.namespace.name(), &self.spec.selector(), command)
            .await?)
    }

    /// Publish internal and external addresses under `<name>.*` keys
    pub fn publish_properties(
        &self,
        properties: &mut PropertyContext,
    ) -> std::result::Result<(), PodError> {
        let internal = self.internal_address()?;
        let external = self.external_address()?;
        let name = &self.spec.name;
        properties.publish_endpoint(name, "internal", &internal);
        properties.publish_endpoint(name, "external", &external);
        properties.set(format!("{name}.url"), external.http_url());
        Ok(())
    }

    fn require_active(&self) -> std::result::Result<&Active, PodError> {
        match (&self.active, self.state) {
            (Some(active), PodState::Running) => Ok(active),
            _ => Err(PodError::NotStarted {
                pod: self.spec.name.clone(),
            }),
        }
    }

    fn check_spec(&self) -> std::result::Result<(), PodError> {
        let invalid = |e: Error| PodError::InvalidSpec {
            pod: self.spec.name.clone(),
            message: e.to_string(),
        };
        self.shape.validate(&self.spec).map_err(invalid)?;
        if let NamespaceTarget::Named(name) = &self.spec.namespace {
            namespace::validate_name(name).map_err(invalid)?;
        }
        Ok(())
    }

    /// The namespace to run in and whether this pod owns the handle.
    ///
    /// An explicit handle is borrowed. An explicit name or cluster gets a
    /// fresh handle. Otherwise the shared namespace wins, and failing that
    /// a fresh handle named by the defaults.
    fn resolve_namespace(&self) -> (Arc<TestNamespace>, bool) {
        let named = match &self.spec.namespace {
            NamespaceTarget::Handle(ns) => return (Arc::clone(ns), false),
            NamespaceTarget::Named(name) => Some(name.clone()),
            NamespaceTarget::Default => None,
        };
        if named.is_none() && self.spec.cluster.is_none() {
            if let Some(shared) = self.defaults.shared_namespace() {
                debug!(pod = %self.spec.name, namespace = %shared.name(), "using shared namespace");
                return (shared, false);
            }
        }
        let cluster = self
            .spec
            .cluster
            .clone()
            .unwrap_or_else(|| self.defaults.resolve_cluster());
        let name = named.unwrap_or_else(|| self.defaults.resolve_namespace_name());
        (Arc::new(TestNamespace::new(name, cluster)), true)
    }

    async fn create_and_wait(
        &self,
        active: &mut Active,
    ) -> std::result::Result<Duration, StartFailure> {
        let client = active.cluster.client();
        let ctx = BuildContext {
            spec: &self.spec,
            namespace: active.namespace.name(),
            service_type: active.cluster.access().service_type(),
        };

        let auxiliary = match self.shape.build_auxiliary(&ctx)? {
            Some(config_map) => {
                client.create(&config_map).await?;
                let mount_path = self
                    .spec
                    .auxiliary_payload()
                    .map(|p| p.mount_path.as_str())
                    .unwrap_or(crate::workload::DEFAULT_AUXILIARY_MOUNT_PATH);
                let created = active.resources.record_auxiliary(&config_map, mount_path)?;
                debug!(pod = %self.spec.name, config_map = %created.config_map(), "auxiliary payload created");
                Some(created)
            }
            None => None,
        };
        let binding = match &auxiliary {
            Some(created) => created.binding(),
            None => AuxiliaryBinding::without_payload(&self.spec).ok_or_else(|| {
                Error::internal_with_context(
                    "start",
                    "shape built no ConfigMap for a spec with an auxiliary payload",
                )
            })?,
        };

        let workload = self.shape.build_workload(&ctx, binding)?;
        client.create(&workload).await?;
        let workload_ref = active.resources.record(&workload)?;
        debug!(pod = %self.spec.name, resource = %workload_ref, "workload created");

        let endpoint = self.shape.build_endpoint(&ctx)?;
        client.create(&endpoint).await?;
        let endpoint_ref = active.resources.record(&endpoint)?;
        debug!(pod = %self.spec.name, resource = %endpoint_ref, "endpoint created");

        let strategy = self
            .spec
            .wait
            .clone()
            .unwrap_or_else(|| self.shape.default_wait(&self.spec));
        let target = PodWaitTarget {
            pod: &self.spec.name,
            kind: self.shape.kind(),
            cluster: &active.cluster,
            endpoint: EndpointTarget {
                namespace: active.namespace.name().to_string(),
                service: endpoint_ref.name.clone(),
                selector: self.spec.selector(),
                port: self.spec.container.primary_port(),
                headless: self.shape.headless_endpoint(),
            },
            external: Mutex::new(None),
        };
        let elapsed = strategy.wait_until_ready(&target).await?;
        let external = target.into_endpoint().await?;
        info!(pod = %self.spec.name, address = %external.address(), forwarded = external.is_forwarded(), "external endpoint");
        active.external = Some(external);
        Ok(elapsed)
    }
}

impl Drop for TestPod {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            warn!(
                pod = %self.spec.name,
                namespace = %active.namespace.name(),
                resources = active.resources.len(),
                "pod dropped without stop(), its resources stay in the cluster"
            );
        }
    }
}

impl std::fmt::Debug for TestPod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPod")
            .field("name", &self.spec.name)
            .field("kind", &self.shape.kind())
            .field("state", &self.state)
            .field("namespace", &self.namespace())
            .finish_non_exhaustive()
    }
}

/// What readiness strategies observe for a starting pod. The external
/// endpoint is resolved on first use, so a port-forward is only opened
/// once a strategy actually needs it.
struct PodWaitTarget<'a> {
    pod: &'a str,
    kind: WorkloadKind,
    cluster: &'a Cluster,
    endpoint: EndpointTarget,
    external: Mutex<Option<ExternalEndpoint>>,
}

impl PodWaitTarget<'_> {
    async fn resolve(&self) -> Result<HostAndPort> {
        let mut slot = self.external.lock().await;
        if let Some(endpoint) = slot.as_ref() {
            return Ok(endpoint.address().clone());
        }
        let endpoint = self
            .cluster
            .access()
            .resolve(self.cluster.client(), &self.endpoint)
            .await?;
        let address = endpoint.address().clone();
        *slot = Some(endpoint);
        Ok(address)
    }

    async fn into_endpoint(self) -> Result<ExternalEndpoint> {
        self.resolve().await?;
        self.external
            .into_inner()
            .ok_or_else(|| Error::internal("external endpoint missing after resolution"))
    }
}

#[async_trait]
impl WaitTarget for PodWaitTarget<'_> {
    fn pod_name(&self) -> &str {
        self.pod
    }

    async fn replica_status(&self) -> Result<Option<ReplicaStatus>> {
        self.cluster
            .client()
            .workload_status(self.kind, &self.endpoint.namespace, self.pod)
            .await
    }

    async fn logs(&self) -> Result<Option<String>> {
        self.cluster
            .client()
            .pod_logs(
                &self.endpoint.namespace,
                &self.endpoint.selector,
                &LogOptions::default(),
            )
            .await
    }

    async fn exec(&self, command: &ExecCommand) -> Result<ExecResult> {
        self.cluster
            .client()
            .exec(&self.endpoint.namespace, &self.endpoint.selector, command)
            .await
    }

    async fn external_address(&self) -> Result<Option<HostAndPort>> {
        self.resolve().await.map(Some)
    }
}
