//! Ephemeral, test-scoped workloads on a Kubernetes cluster
//!
//! A [`TestPod`] turns a [`WorkloadSpec`] into the small set of cluster
//! objects needed to run it (an optional init ConfigMap, a Deployment or
//! StatefulSet, and a Service), waits until the workload actually serves,
//! and removes everything again on [`TestPod::stop`] or when start fails
//! partway through.
//!
//! Which cluster and namespace a pod lands in comes from, in order: the
//! spec itself, the [`defaults`] captured on the constructing thread, the
//! process-wide defaults, and finally auto-discovery plus a generated
//! namespace name.

#![deny(missing_docs)]

pub mod cluster;
pub mod defaults;
pub mod error;
pub mod host;
pub mod namespace;
pub mod naming;
pub mod pod;
pub mod properties;
pub mod wait;
pub mod workload;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cluster::{
    AccessStrategy, Cluster, ClusterClient, ExecCommand, ExecResult, KubeClusterClient, LogOptions,
};
pub use defaults::{DefaultsContext, TestScope};
pub use error::{CommandFailed, PodError, ReadinessTimeout, StartFailure};
pub use host::HostAndPort;
pub use namespace::TestNamespace;
pub use pod::{PodState, TestPod};
pub use properties::PropertyContext;
pub use wait::WaitStrategy;
pub use workload::{AuxiliaryPayload, Customizers, ExtraContainer, ProbeSpec, WorkloadSpec};

pub use podlab_common::{Error, Result};
