//! Object builders shared by both workload shapes

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, ExecAction, HTTPGetAction,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use super::{
    AuxiliaryBinding, Customizers, ExtraContainer, PersistentStorage, ProbeAction, ProbeSpec,
    WorkloadSpec,
};
use crate::cluster::ManagedResource;
use podlab_common::{LABEL_APP, LABEL_MANAGED_BY, LABEL_MANAGED_BY_PODLAB};

/// Volume name of the mounted auxiliary payload
pub const INIT_VOLUME: &str = "init-scripts";
/// Volume (and claim template) name of persistent storage
pub const DATA_VOLUME: &str = "data";
/// Name of the primary port on containers and Services
pub const PRIMARY_PORT_NAME: &str = "primary";

/// User labels plus `app` and managed-by, which always win
pub fn labels(spec: &WorkloadSpec) -> BTreeMap<String, String> {
    let mut labels = spec.labels.clone();
    labels.extend(selector_labels(spec));
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_PODLAB.to_string(),
    );
    labels
}

/// `app=<name>`
pub fn selector_labels(spec: &WorkloadSpec) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_APP.to_string(), spec.name.clone())])
}

/// Metadata for an object owned by `spec`
pub fn object_meta(spec: &WorkloadSpec, name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels(spec)),
        ..Default::default()
    }
}

/// Name of the auxiliary ConfigMap for a pod
pub fn auxiliary_name(spec: &WorkloadSpec) -> String {
    format!("{}-init", spec.name)
}

/// ConfigMap holding the auxiliary payload, `None` without one
pub fn auxiliary_config_map(spec: &WorkloadSpec, namespace: &str) -> Option<ManagedResource> {
    let payload = spec.auxiliary_payload()?;
    Some(ManagedResource::ConfigMap(ConfigMap {
        metadata: object_meta(spec, &auxiliary_name(spec), namespace),
        data: Some(payload.files.clone()),
        ..Default::default()
    }))
}

fn port_name(spec: &WorkloadSpec, port: u16) -> String {
    if port == spec.container.primary_port() {
        PRIMARY_PORT_NAME.to_string()
    } else {
        format!("port-{}", port)
    }
}

/// Kubernetes probe from a [`ProbeSpec`]; `primary_port` fills in an
/// HTTP probe without an explicit port
pub fn probe(spec: &ProbeSpec, primary_port: u16) -> Probe {
    let mut probe = Probe {
        initial_delay_seconds: Some(spec.initial_delay_seconds),
        period_seconds: Some(spec.period_seconds),
        timeout_seconds: Some(spec.timeout_seconds),
        failure_threshold: Some(spec.failure_threshold),
        ..Default::default()
    };
    match &spec.action {
        ProbeAction::HttpGet { path, port } => {
            probe.http_get = Some(HTTPGetAction {
                path: Some(path.clone()),
                port: IntOrString::Int(i32::from(port.unwrap_or(primary_port))),
                ..Default::default()
            });
        }
        ProbeAction::TcpSocket { port } => {
            probe.tcp_socket = Some(TCPSocketAction {
                port: IntOrString::Int(i32::from(*port)),
                ..Default::default()
            });
        }
        ProbeAction::Exec { command } => {
            probe.exec = Some(ExecAction {
                command: Some(command.clone()),
            });
        }
    }
    probe
}

fn env_vars(env: &BTreeMap<String, String>) -> Option<Vec<EnvVar>> {
    let vars: Vec<EnvVar> = env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    (!vars.is_empty()).then_some(vars)
}

fn non_empty(items: &[String]) -> Option<Vec<String>> {
    (!items.is_empty()).then(|| items.to_vec())
}

fn resource_requests(spec: &WorkloadSpec) -> Option<ResourceRequirements> {
    let mut requests = BTreeMap::new();
    if let Some(cpu) = &spec.container.cpu_request {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.container.memory_request {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!requests.is_empty()).then(|| ResourceRequirements {
        requests: Some(requests),
        ..Default::default()
    })
}

/// The primary container. Mounts the auxiliary payload when `auxiliary`
/// carries a created ConfigMap and the data volume when `storage` is set.
pub fn container(
    spec: &WorkloadSpec,
    auxiliary: AuxiliaryBinding<'_>,
    storage: Option<&PersistentStorage>,
) -> Container {
    let c = &spec.container;

    let ports = c
        .exposed_ports()
        .into_iter()
        .map(|port| ContainerPort {
            name: Some(port_name(spec, port)),
            container_port: i32::from(port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let mut mounts = Vec::new();
    if let Some(created) = auxiliary.created() {
        mounts.push(VolumeMount {
            name: INIT_VOLUME.to_string(),
            mount_path: created.mount_path().to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    if let Some(storage) = storage {
        mounts.push(VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: storage.mount_path.clone(),
            ..Default::default()
        });
    }

    let primary = c.primary_port();
    let readiness = c
        .readiness_probe
        .clone()
        .unwrap_or_else(|| ProbeSpec::tcp(primary));

    Container {
        name: spec.name.clone(),
        image: Some(c.image.clone()),
        ports: Some(ports),
        env: env_vars(&c.env),
        command: non_empty(&c.command),
        args: non_empty(&c.args),
        resources: resource_requests(spec),
        readiness_probe: Some(probe(&readiness, primary)),
        liveness_probe: c.liveness_probe.as_ref().map(|p| probe(p, primary)),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    }
}

/// An init container or sidecar
pub fn extra_container(c: &ExtraContainer) -> Container {
    let ports: Vec<ContainerPort> = c
        .ports
        .iter()
        .map(|port| ContainerPort {
            container_port: i32::from(*port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();
    let mounts: Vec<VolumeMount> = c
        .volume_mounts
        .iter()
        .map(|(volume, path)| VolumeMount {
            name: volume.clone(),
            mount_path: path.clone(),
            ..Default::default()
        })
        .collect();

    Container {
        name: c.name.clone(),
        image: Some(c.image.clone()),
        ports: (!ports.is_empty()).then_some(ports),
        env: env_vars(&c.env),
        command: non_empty(&c.command),
        args: non_empty(&c.args),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    }
}

/// Volume backed by the created auxiliary ConfigMap
fn auxiliary_volume(config_map: &str) -> Volume {
    Volume {
        name: INIT_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod template with pod-spec customizers applied. Init containers run in
/// registration order; sidecars follow the primary container.
pub fn pod_template(
    spec: &WorkloadSpec,
    auxiliary: AuxiliaryBinding<'_>,
    storage: Option<&PersistentStorage>,
) -> PodTemplateSpec {
    let volumes = auxiliary
        .created()
        .map(|created| vec![auxiliary_volume(created.config_map())]);

    let mut containers = vec![container(spec, auxiliary, storage)];
    containers.extend(spec.sidecars.iter().map(extra_container));
    let init_containers: Vec<Container> = spec.init_containers.iter().map(extra_container).collect();

    let mut pod_spec = PodSpec {
        init_containers: (!init_containers.is_empty()).then_some(init_containers),
        containers,
        volumes,
        ..Default::default()
    };
    Customizers::apply(&spec.customizers.pod_spec, &mut pod_spec);

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels(spec)),
            annotations: (!spec.annotations.is_empty()).then(|| spec.annotations.clone()),
            ..Default::default()
        }),
        spec: Some(pod_spec),
    }
}

/// Endpoint Service named after the pod. A headless Service gets
/// `clusterIP: None`; otherwise `service_type` decides how it is exposed.
pub fn service(
    spec: &WorkloadSpec,
    namespace: &str,
    service_type: &str,
    headless: bool,
) -> ManagedResource {
    let ports = spec
        .container
        .exposed_ports()
        .into_iter()
        .map(|port| ServicePort {
            name: Some(port_name(spec, port)),
            port: i32::from(port),
            target_port: Some(IntOrString::Int(i32::from(port))),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let service_spec = if headless {
        ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ..Default::default()
        }
    } else {
        ServiceSpec {
            type_: Some(service_type.to_string()),
            ..Default::default()
        }
    };

    let mut service = Service {
        metadata: object_meta(spec, &spec.name, namespace),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(spec)),
            ports: Some(ports),
            ..service_spec
        }),
        ..Default::default()
    };
    Customizers::apply(&spec.customizers.service, &mut service);
    ManagedResource::Service(service)
}

/// Per-instance claim template, customizers applied
pub fn volume_claim(spec: &WorkloadSpec, storage: &PersistentStorage) -> PersistentVolumeClaim {
    let mut claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            labels: Some(labels(spec)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    Customizers::apply(&spec.customizers.volume_claim, &mut claim);
    claim
}
