//! What a pod has created so far, and proof that its auxiliary payload exists

use tracing::{debug, warn};

use crate::cluster::{ClusterClient, ManagedResource, ResourceKind, ResourceRef};
use crate::workload::WorkloadSpec;
use podlab_common::{Error, Result};

/// Objects created for one pod, in creation order
#[derive(Debug, Default)]
pub struct ManagedResourceSet {
    created: Vec<ResourceRef>,
}

impl ManagedResourceSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an object whose create call succeeded
    pub fn record(&mut self, resource: &ManagedResource) -> Result<ResourceRef> {
        let r = resource.resource_ref()?;
        self.created.push(r.clone());
        Ok(r)
    }

    /// Record the auxiliary ConfigMap whose create call succeeded, returning
    /// the handle a workload needs to mount it
    pub fn record_auxiliary(
        &mut self,
        config_map: &ManagedResource,
        mount_path: &str,
    ) -> Result<CreatedAuxiliary> {
        if config_map.kind() != ResourceKind::ConfigMap {
            return Err(Error::validation(format!(
                "auxiliary payload must be a ConfigMap, got {}",
                config_map.kind()
            )));
        }
        let r = self.record(config_map)?;
        Ok(CreatedAuxiliary {
            config_map: r.name,
            mount_path: mount_path.to_string(),
        })
    }

    /// Number of objects still recorded
    pub fn len(&self) -> usize {
        self.created.len()
    }

    /// Whether nothing is recorded
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Recorded objects in creation order
    pub fn as_slice(&self) -> &[ResourceRef] {
        &self.created
    }

    /// Delete everything in reverse creation order.
    ///
    /// Failures are logged and skipped so one stuck object does not keep
    /// the rest alive; an object that is already gone counts as deleted.
    /// The set is empty afterwards.
    pub async fn unwind(&mut self, client: &dyn ClusterClient, pod: &str) {
        while let Some(resource) = self.created.pop() {
            match client.delete(&resource).await {
                Ok(()) => debug!(pod = %pod, resource = %resource, "deleted"),
                Err(e) if e.is_not_found() => {
                    debug!(pod = %pod, resource = %resource, "already gone")
                }
                Err(e) => warn!(
                    pod = %pod,
                    resource = %resource,
                    error = %e,
                    "failed to delete resource, it may be left behind"
                ),
            }
        }
    }
}

/// Handle for an auxiliary ConfigMap that exists in the cluster.
///
/// Only [`ManagedResourceSet::record_auxiliary`] creates one, so a
/// workload that mounts a payload cannot be built before the payload's
/// create call has succeeded.
#[derive(Debug, PartialEq, Eq)]
pub struct CreatedAuxiliary {
    config_map: String,
    mount_path: String,
}

impl CreatedAuxiliary {
    /// Name the ConfigMap was created under
    pub fn config_map(&self) -> &str {
        &self.config_map
    }

    /// Mount directory in the container
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Binding that mounts this ConfigMap
    pub fn binding(&self) -> AuxiliaryBinding<'_> {
        AuxiliaryBinding(Some(self))
    }
}

/// What the workload builder mounts: nothing, or a created auxiliary
#[derive(Clone, Copy, Debug)]
pub struct AuxiliaryBinding<'a>(Option<&'a CreatedAuxiliary>);

impl<'a> AuxiliaryBinding<'a> {
    /// Binding for a spec without payload; `None` when the spec has one,
    /// since such a spec must go through [`CreatedAuxiliary::binding`]
    pub fn without_payload(spec: &WorkloadSpec) -> Option<Self> {
        match spec.auxiliary_payload() {
            Some(_) => None,
            None => Some(Self(None)),
        }
    }

    /// The created auxiliary, if any
    pub fn created(&self) -> Option<&'a CreatedAuxiliary> {
        self.0
    }
}
