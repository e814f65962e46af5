//! The two workload kinds and what each builds

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::build;
use super::{AuxiliaryBinding, Customizers, WorkloadSpec};
use crate::cluster::{ManagedResource, WorkloadKind};
use crate::wait::WaitStrategy;
use podlab_common::{Error, Result};

/// Readiness deadline for stateless workloads
pub const STATELESS_READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
/// Readiness deadline for stable-identity workloads
pub const STABLE_IDENTITY_READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Inputs every builder needs
#[derive(Clone, Copy, Debug)]
pub struct BuildContext<'a> {
    /// What to run
    pub spec: &'a WorkloadSpec,
    /// Resolved namespace name
    pub namespace: &'a str,
    /// Service type for routable endpoints
    pub service_type: &'a str,
}

/// A kind of workload: how its objects look and how readiness is judged
pub trait WorkloadShape: Send + Sync {
    /// Workload kind
    fn kind(&self) -> WorkloadKind;

    /// Reject specs this kind cannot run
    fn validate(&self, spec: &WorkloadSpec) -> Result<()> {
        spec.validate()
    }

    /// ConfigMap for the auxiliary payload, if the spec has one
    fn build_auxiliary(&self, ctx: &BuildContext<'_>) -> Result<Option<ManagedResource>> {
        Ok(build::auxiliary_config_map(ctx.spec, ctx.namespace))
    }

    /// The workload object, mounting whatever `auxiliary` binds
    fn build_workload(
        &self,
        ctx: &BuildContext<'_>,
        auxiliary: AuxiliaryBinding<'_>,
    ) -> Result<ManagedResource>;

    /// Whether the endpoint Service is headless
    fn headless_endpoint(&self) -> bool;

    /// The endpoint Service
    fn build_endpoint(&self, ctx: &BuildContext<'_>) -> Result<ManagedResource> {
        Ok(build::service(
            ctx.spec,
            ctx.namespace,
            ctx.service_type,
            self.headless_endpoint(),
        ))
    }

    /// Readiness strategy when the spec does not name one
    fn default_wait(&self, spec: &WorkloadSpec) -> WaitStrategy;
}

/// Interchangeable replicas behind a load-balanced Service (a Deployment)
#[derive(Clone, Copy, Debug, Default)]
pub struct Stateless;

impl WorkloadShape for Stateless {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Stateless
    }

    fn validate(&self, spec: &WorkloadSpec) -> Result<()> {
        spec.validate()?;
        if spec.storage.is_some() {
            return Err(Error::validation_for_field(
                "storage",
                "persistent storage needs a stable-identity workload",
            ));
        }
        Ok(())
    }

    fn build_workload(
        &self,
        ctx: &BuildContext<'_>,
        auxiliary: AuxiliaryBinding<'_>,
    ) -> Result<ManagedResource> {
        let spec = ctx.spec;
        let mut deployment = Deployment {
            metadata: build::object_meta(spec, &spec.name, ctx.namespace),
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(build::selector_labels(spec)),
                    ..Default::default()
                },
                template: build::pod_template(spec, auxiliary, None),
                ..Default::default()
            }),
            ..Default::default()
        };
        Customizers::apply(&spec.customizers.deployment, &mut deployment);
        Ok(ManagedResource::Deployment(deployment))
    }

    fn headless_endpoint(&self) -> bool {
        false
    }

    fn default_wait(&self, _spec: &WorkloadSpec) -> WaitStrategy {
        WaitStrategy::readiness_probe().with_timeout(STATELESS_READY_TIMEOUT)
    }
}

/// Replicas with stable names and optional per-instance storage behind a
/// headless Service (a StatefulSet)
#[derive(Clone, Copy, Debug, Default)]
pub struct StableIdentity;

impl WorkloadShape for StableIdentity {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::StableIdentity
    }

    fn build_workload(
        &self,
        ctx: &BuildContext<'_>,
        auxiliary: AuxiliaryBinding<'_>,
    ) -> Result<ManagedResource> {
        let spec = ctx.spec;
        let storage = spec.storage.as_ref();

        let mut stateful_set = StatefulSet {
            metadata: build::object_meta(spec, &spec.name, ctx.namespace),
            spec: Some(StatefulSetSpec {
                // The headless endpoint Service carries the pod's name
                service_name: spec.name.clone(),
                replicas: Some(spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(build::selector_labels(spec)),
                    ..Default::default()
                },
                template: build::pod_template(spec, auxiliary, storage),
                volume_claim_templates: storage.map(|s| vec![build::volume_claim(spec, s)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        Customizers::apply(&spec.customizers.stateful_set, &mut stateful_set);
        Ok(ManagedResource::StatefulSet(stateful_set))
    }

    fn headless_endpoint(&self) -> bool {
        true
    }

    fn default_wait(&self, _spec: &WorkloadSpec) -> WaitStrategy {
        WaitStrategy::readiness_probe().with_timeout(STABLE_IDENTITY_READY_TIMEOUT)
    }
}
