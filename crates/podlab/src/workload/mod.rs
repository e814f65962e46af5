//! What to run: the workload spec and how it becomes cluster objects

mod build;
mod resources;
mod shape;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodSpec, Service};

pub use resources::{AuxiliaryBinding, CreatedAuxiliary, ManagedResourceSet};
pub use build::{DATA_VOLUME, INIT_VOLUME};
pub use shape::{BuildContext, StableIdentity, Stateless, WorkloadShape};

use crate::cluster::Cluster;
use crate::namespace::TestNamespace;
use crate::naming;
use crate::wait::WaitStrategy;
use podlab_common::{Error, Result};

/// Port used when an image is started without any
pub const DEFAULT_PORT: u16 = 80;

/// Where the auxiliary payload is mounted unless told otherwise
pub const DEFAULT_AUXILIARY_MOUNT_PATH: &str = "/docker-entrypoint-initdb.d";

/// Where persistent storage is mounted unless told otherwise
pub const DEFAULT_DATA_MOUNT_PATH: &str = "/data";

/// Which namespace a pod should run in
#[derive(Clone, Debug, Default)]
pub enum NamespaceTarget {
    /// Resolve through the defaults
    #[default]
    Default,
    /// A namespace with this name, created if missing
    Named(String),
    /// An existing handle, possibly shared with other pods
    Handle(Arc<TestNamespace>),
}

/// How the platform probes the container
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeAction {
    /// HTTP GET on `path` at `port`
    HttpGet {
        /// Request path
        path: String,
        /// Container port; the primary port, resolved when the pod is built, when unset
        port: Option<u16>,
    },
    /// TCP connect to `port`
    TcpSocket {
        /// Container port
        port: u16,
    },
    /// Run a command in the container
    Exec {
        /// Command and arguments
        command: Vec<String>,
    },
}

/// Container probe with timing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeSpec {
    /// Probe action
    pub action: ProbeAction,
    /// Seconds before the first probe
    pub initial_delay_seconds: i32,
    /// Seconds between probes
    pub period_seconds: i32,
    /// Seconds before a probe counts as failed
    pub timeout_seconds: i32,
    /// Consecutive failures before the container is marked unready
    pub failure_threshold: i32,
}

impl ProbeSpec {
    /// Probe with default timing (5s delay, 10s period, 5s timeout)
    pub fn new(action: ProbeAction) -> Self {
        Self {
            action,
            initial_delay_seconds: 5,
            period_seconds: 10,
            timeout_seconds: 5,
            failure_threshold: 3,
        }
    }

    /// HTTP GET probe on a fixed port
    pub fn http(path: &str, port: u16) -> Self {
        Self::new(ProbeAction::HttpGet {
            path: leading_slash(path),
            port: Some(port),
        })
    }

    /// HTTP GET probe on whatever the primary port is when the pod is built
    pub fn http_on_primary_port(path: &str) -> Self {
        Self::new(ProbeAction::HttpGet {
            path: leading_slash(path),
            port: None,
        })
    }

    /// TCP probe
    pub fn tcp(port: u16) -> Self {
        Self::new(ProbeAction::TcpSocket { port })
    }

    /// Exec probe
    pub fn exec<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ProbeAction::Exec {
            command: command.into_iter().map(Into::into).collect(),
        })
    }

    /// Change the initial delay
    pub fn with_initial_delay(mut self, seconds: i32) -> Self {
        self.initial_delay_seconds = seconds;
        self
    }

    /// Change the probe period
    pub fn with_period(mut self, seconds: i32) -> Self {
        self.period_seconds = seconds;
        self
    }
}

/// The primary container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// Exposed container ports
    pub ports: Vec<u16>,
    /// Port published as the pod's primary endpoint; first port when unset
    pub primary_port: Option<u16>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Entrypoint override
    pub command: Vec<String>,
    /// Arguments
    pub args: Vec<String>,
    /// CPU request, e.g. `250m`
    pub cpu_request: Option<String>,
    /// Memory request, e.g. `256Mi`
    pub memory_request: Option<String>,
    /// Readiness probe; a TCP probe on the primary port when unset
    pub readiness_probe: Option<ProbeSpec>,
    /// Liveness probe
    pub liveness_probe: Option<ProbeSpec>,
}

impl ContainerSpec {
    /// The primary port: explicit, else the first port, else [`DEFAULT_PORT`]
    pub fn primary_port(&self) -> u16 {
        self.primary_port
            .or_else(|| self.ports.first().copied())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Exposed ports; [`DEFAULT_PORT`] when none are configured
    pub fn exposed_ports(&self) -> Vec<u16> {
        if self.ports.is_empty() {
            vec![DEFAULT_PORT]
        } else {
            self.ports.clone()
        }
    }
}

/// An init container or sidecar next to the primary container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtraContainer {
    /// Container name, unique within the pod
    pub name: String,
    /// Image reference
    pub image: String,
    /// Entrypoint override
    pub command: Vec<String>,
    /// Arguments
    pub args: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Container ports (not published on the Service)
    pub ports: Vec<u16>,
    /// Volume name to mount path; the volume must exist in the pod
    pub volume_mounts: BTreeMap<String, String>,
}

impl ExtraContainer {
    /// Container `name` running `image`
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Override the entrypoint
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Expose a port
    pub fn with_port(mut self, port: u16) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self
    }

    /// Mount a pod volume, e.g. [`INIT_VOLUME`] or [`DATA_VOLUME`]
    pub fn with_volume_mount(mut self, volume: impl Into<String>, path: impl Into<String>) -> Self {
        self.volume_mounts.insert(volume.into(), path.into());
        self
    }
}

/// Files materialized as a ConfigMap and mounted into the container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuxiliaryPayload {
    /// File name to content
    pub files: BTreeMap<String, String>,
    /// Mount directory
    pub mount_path: String,
}

impl AuxiliaryPayload {
    /// Empty payload mounted at [`DEFAULT_AUXILIARY_MOUNT_PATH`]
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            mount_path: DEFAULT_AUXILIARY_MOUNT_PATH.to_string(),
        }
    }

    /// Add a file
    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }

    /// Mount somewhere else
    pub fn mounted_at(mut self, path: impl Into<String>) -> Self {
        self.mount_path = path.into();
        self
    }

    /// Whether there is nothing to mount
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for AuxiliaryPayload {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-instance volume claim for stable-identity workloads
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistentStorage {
    /// Requested size, e.g. `1Gi`
    pub size: String,
    /// Mount directory
    pub mount_path: String,
    /// Storage class; the cluster default when unset
    pub storage_class: Option<String>,
}

/// Mutates the pod spec after it is built
pub type PodSpecCustomizer = Arc<dyn Fn(&mut PodSpec) + Send + Sync>;
/// Mutates a Deployment after it is built
pub type DeploymentCustomizer = Arc<dyn Fn(&mut Deployment) + Send + Sync>;
/// Mutates a StatefulSet after it is built
pub type StatefulSetCustomizer = Arc<dyn Fn(&mut StatefulSet) + Send + Sync>;
/// Mutates the endpoint Service after it is built
pub type ServiceCustomizer = Arc<dyn Fn(&mut Service) + Send + Sync>;
/// Mutates the volume claim template after it is built
pub type VolumeClaimCustomizer = Arc<dyn Fn(&mut PersistentVolumeClaim) + Send + Sync>;

/// Low-level hooks, applied in registration order right before an object
/// is created
#[derive(Clone, Default)]
pub struct Customizers {
    /// Pod spec hooks (both workload kinds)
    pub pod_spec: Vec<PodSpecCustomizer>,
    /// Deployment hooks
    pub deployment: Vec<DeploymentCustomizer>,
    /// StatefulSet hooks
    pub stateful_set: Vec<StatefulSetCustomizer>,
    /// Service hooks
    pub service: Vec<ServiceCustomizer>,
    /// Volume claim template hooks
    pub volume_claim: Vec<VolumeClaimCustomizer>,
}

impl Customizers {
    pub(crate) fn apply<T>(hooks: &[Arc<dyn Fn(&mut T) + Send + Sync>], target: &mut T) {
        for hook in hooks {
            hook(target);
        }
    }
}

impl fmt::Debug for Customizers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Customizers")
            .field("pod_spec", &self.pod_spec.len())
            .field("deployment", &self.deployment.len())
            .field("stateful_set", &self.stateful_set.len())
            .field("service", &self.service.len())
            .field("volume_claim", &self.volume_claim.len())
            .finish()
    }
}

/// Everything needed to run one workload
#[derive(Clone, Debug)]
pub struct WorkloadSpec {
    /// DNS-1123 name, unique within the namespace
    pub name: String,
    /// Target namespace
    pub namespace: NamespaceTarget,
    /// Target cluster; resolved through the defaults when unset
    pub cluster: Option<Cluster>,
    /// Extra labels on every object
    pub labels: BTreeMap<String, String>,
    /// Annotations on the pod template
    pub annotations: BTreeMap<String, String>,
    /// The primary container
    pub container: ContainerSpec,
    /// Containers run to completion, in order, before the primary one starts
    pub init_containers: Vec<ExtraContainer>,
    /// Containers running alongside the primary one
    pub sidecars: Vec<ExtraContainer>,
    /// Replica count
    pub replicas: i32,
    /// Optional config payload mounted into the container
    pub auxiliary: Option<AuxiliaryPayload>,
    /// Optional per-instance storage (stable-identity only)
    pub storage: Option<PersistentStorage>,
    /// Readiness strategy; chosen by workload kind when unset
    pub wait: Option<WaitStrategy>,
    /// Low-level hooks
    pub customizers: Customizers,
}

impl WorkloadSpec {
    /// Spec for `image`, named after the image's last path segment
    pub fn new(image: impl Into<String>) -> Self {
        let image = image.into();
        Self {
            name: name_from_image(&image),
            namespace: NamespaceTarget::Default,
            cluster: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            container: ContainerSpec {
                image,
                ..Default::default()
            },
            init_containers: Vec::new(),
            sidecars: Vec::new(),
            replicas: 1,
            auxiliary: None,
            storage: None,
            wait: None,
            customizers: Customizers::default(),
        }
    }

    /// Override the name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Run in the namespace with this name
    pub fn in_namespace(mut self, name: impl Into<String>) -> Self {
        self.namespace = NamespaceTarget::Named(name.into());
        self
    }

    /// Run in an existing namespace handle
    pub fn in_test_namespace(mut self, namespace: Arc<TestNamespace>) -> Self {
        self.namespace = NamespaceTarget::Handle(namespace);
        self
    }

    /// Run on this cluster
    pub fn in_cluster(mut self, cluster: Cluster) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a pod annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Expose a port; the first one is primary unless set explicitly
    pub fn with_port(mut self, port: u16) -> Self {
        if !self.container.ports.contains(&port) {
            self.container.ports.push(port);
        }
        self
    }

    /// Expose `port` and make it primary
    pub fn with_primary_port(mut self, port: u16) -> Self {
        self = self.with_port(port);
        self.container.primary_port = Some(port);
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.container.env.insert(key.into(), value.into());
        self
    }

    /// Override the entrypoint
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.container.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.container.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Request CPU and memory
    pub fn with_resources(mut self, cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        self.container.cpu_request = Some(cpu.into());
        self.container.memory_request = Some(memory.into());
        self
    }

    /// Probe readiness over HTTP on the primary port
    pub fn with_http_readiness_probe(mut self, path: &str) -> Self {
        self.container.readiness_probe = Some(ProbeSpec::http_on_primary_port(path));
        self
    }

    /// Use a custom readiness probe
    pub fn with_readiness_probe(mut self, probe: ProbeSpec) -> Self {
        self.container.readiness_probe = Some(probe);
        self
    }

    /// Use a liveness probe
    pub fn with_liveness_probe(mut self, probe: ProbeSpec) -> Self {
        self.container.liveness_probe = Some(probe);
        self
    }

    /// Run `container` to completion before the primary container starts
    pub fn with_init_container(mut self, container: ExtraContainer) -> Self {
        self.init_containers.push(container);
        self
    }

    /// Run `container` next to the primary container
    pub fn with_sidecar(mut self, container: ExtraContainer) -> Self {
        self.sidecars.push(container);
        self
    }

    /// Set the replica count
    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Mount a file from the auxiliary payload
    pub fn with_auxiliary_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        let payload = self.auxiliary.take().unwrap_or_default();
        self.auxiliary = Some(payload.with_file(name, content));
        self
    }

    /// Replace the auxiliary payload
    pub fn with_auxiliary(mut self, payload: AuxiliaryPayload) -> Self {
        self.auxiliary = Some(payload);
        self
    }

    /// Give each instance a volume of `size` at [`DEFAULT_DATA_MOUNT_PATH`]
    pub fn with_persistent_storage(mut self, size: impl Into<String>) -> Self {
        self.storage = Some(PersistentStorage {
            size: size.into(),
            mount_path: DEFAULT_DATA_MOUNT_PATH.to_string(),
            storage_class: None,
        });
        self
    }

    /// Wait for readiness with `strategy`
    pub fn waiting_for(mut self, strategy: WaitStrategy) -> Self {
        self.wait = Some(strategy);
        self
    }

    /// Hook into the pod spec
    pub fn customize_pod_spec<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut PodSpec) + Send + Sync + 'static,
    {
        self.customizers.pod_spec.push(Arc::new(hook));
        self
    }

    /// Hook into the Deployment
    pub fn customize_deployment<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Deployment) + Send + Sync + 'static,
    {
        self.customizers.deployment.push(Arc::new(hook));
        self
    }

    /// Hook into the StatefulSet
    pub fn customize_stateful_set<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut StatefulSet) + Send + Sync + 'static,
    {
        self.customizers.stateful_set.push(Arc::new(hook));
        self
    }

    /// Hook into the Service
    pub fn customize_service<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Service) + Send + Sync + 'static,
    {
        self.customizers.service.push(Arc::new(hook));
        self
    }

    /// Hook into the volume claim template
    pub fn customize_volume_claim<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut PersistentVolumeClaim) + Send + Sync + 'static,
    {
        self.customizers.volume_claim.push(Arc::new(hook));
        self
    }

    /// Label selector matching this workload's pods
    pub fn selector(&self) -> String {
        format!("{}={}", podlab_common::LABEL_APP, self.name)
    }

    /// Auxiliary payload, if it has any files
    pub fn auxiliary_payload(&self) -> Option<&AuxiliaryPayload> {
        self.auxiliary.as_ref().filter(|p| !p.is_empty())
    }

    /// Reject specs that cannot become valid objects
    pub fn validate(&self) -> Result<()> {
        if !naming::is_dns_label(&self.name) {
            return Err(Error::validation_for_field(
                "name",
                format!("'{}' is not a valid DNS-1123 label", self.name),
            ));
        }
        if self.container.image.trim().is_empty() {
            return Err(Error::validation_for_field("image", "image must not be empty"));
        }
        if self.container.ports.contains(&0) {
            return Err(Error::validation_for_field("ports", "port 0 is not allowed"));
        }
        if let Some(primary) = self.container.primary_port {
            if !self.container.ports.contains(&primary) {
                return Err(Error::validation_for_field(
                    "primary_port",
                    format!("primary port {} is not exposed", primary),
                ));
            }
        }
        if self.replicas < 1 {
            return Err(Error::validation_for_field("replicas", "at least one replica is required"));
        }
        self.validate_extra_containers()
    }

    fn validate_extra_containers(&self) -> Result<()> {
        let mut names = vec![self.name.as_str()];
        for (field, c) in self
            .init_containers
            .iter()
            .map(|c| ("init_containers", c))
            .chain(self.sidecars.iter().map(|c| ("sidecars", c)))
        {
            if !naming::is_dns_label(&c.name) {
                return Err(Error::validation_for_field(
                    field,
                    format!("'{}' is not a valid container name", c.name),
                ));
            }
            if names.contains(&c.name.as_str()) {
                return Err(Error::validation_for_field(
                    field,
                    format!("container name '{}' is used twice", c.name),
                ));
            }
            names.push(&c.name);
            if c.image.trim().is_empty() {
                return Err(Error::validation_for_field(
                    field,
                    format!("container '{}' has no image", c.name),
                ));
            }
            if c.ports.contains(&0) {
                return Err(Error::validation_for_field(field, "port 0 is not allowed"));
            }
        }
        Ok(())
    }
}

fn leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// `registry:5000/team/app:1.2@sha256:..` becomes `app`
pub fn name_from_image(image: &str) -> String {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_segment = without_digest.rsplit('/').next().unwrap_or(without_digest);
    let repository = last_segment.split(':').next().unwrap_or(last_segment);
    let name = naming::sanitize(repository);
    name.chars()
        .take(podlab_common::MAX_DNS_LABEL_LEN)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}
