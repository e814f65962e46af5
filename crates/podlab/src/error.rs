//! Errors surfaced by test pods
//!
//! Anything that goes wrong between namespace resolution and readiness is
//! reported as [`PodError::StartFailed`], after the resources created so
//! far have been removed again. The cause says whether the workload never
//! became ready ([`ReadinessTimeout`]) or a cluster call failed. Cleanup
//! problems are only logged.

use std::time::Duration;

use thiserror::Error;

use crate::cluster::ResourceRef;
use podlab_common::kube_utils::format_duration;

fn fmt_elapsed(d: &Duration) -> String {
    format_duration(*d)
}

/// A workload did not become ready before its deadline
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("pod '{pod}' not ready after {} waiting for {strategy}: {last_state}", fmt_elapsed(.elapsed))]
pub struct ReadinessTimeout {
    /// Pod name
    pub pod: String,
    /// Description of the strategy that gave up
    pub strategy: String,
    /// Time spent waiting
    pub elapsed: Duration,
    /// Last observed state
    pub last_state: String,
}

/// A command run inside a pod exited non-zero
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("command exited with code {exit_code}: {output}")]
pub struct CommandFailed {
    /// Process exit code
    pub exit_code: i32,
    /// Stderr, or stdout when stderr was empty
    pub output: String,
}

/// Why a start failed
#[derive(Debug, Error)]
pub enum StartFailure {
    /// The workload never became ready
    #[error(transparent)]
    Readiness(#[from] ReadinessTimeout),
    /// A cluster call failed
    #[error(transparent)]
    Cluster(#[from] podlab_common::Error),
}

/// Errors returned by [`crate::TestPod`]
#[derive(Debug, Error)]
pub enum PodError {
    /// Start failed; everything created during the attempt was deleted
    #[error("failed to start pod '{pod}': {cause}")]
    StartFailed {
        /// Pod name
        pod: String,
        /// Resources created before the failure, in creation order
        created: Vec<ResourceRef>,
        /// Underlying failure
        #[source]
        cause: StartFailure,
    },

    /// The spec cannot be turned into cluster objects
    #[error("invalid spec for pod '{pod}': {message}")]
    InvalidSpec {
        /// Pod name
        pod: String,
        /// What is wrong
        message: String,
    },

    /// The operation needs a started pod
    #[error("pod '{pod}' is not started")]
    NotStarted {
        /// Pod name
        pod: String,
    },

    /// Cluster error outside of start, passed through unchanged
    #[error(transparent)]
    Cluster(#[from] podlab_common::Error),
}

impl PodError {
    /// The readiness timeout behind a failed start, if that was the cause
    pub fn readiness_timeout(&self) -> Option<&ReadinessTimeout> {
        match self {
            PodError::StartFailed {
                cause: StartFailure::Readiness(t),
                ..
            } => Some(t),
            _ => None,
        }
    }

    /// Whether start failed because the workload never became ready
    pub fn is_readiness_timeout(&self) -> bool {
        self.readiness_timeout().is_some()
    }

    /// Whether this is a start failure of any kind
    pub fn is_start_failure(&self) -> bool {
        matches!(self, PodError::StartFailed { .. })
    }
}
