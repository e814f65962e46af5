//! Process configuration resolved from `PODLAB_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::kube_utils::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use crate::Error;

/// Explicit kubeconfig path; otherwise kube's inference chain applies
pub const ENV_KUBECONFIG: &str = "PODLAB_KUBECONFIG";
/// Prefix for generated namespace names
pub const ENV_NAMESPACE_PREFIX: &str = "PODLAB_NAMESPACE_PREFIX";
/// How tests reach workloads from outside the cluster
pub const ENV_ACCESS_STRATEGY: &str = "PODLAB_ACCESS_STRATEGY";
/// Node address used for node-port access
pub const ENV_NODE_HOST: &str = "PODLAB_NODE_HOST";
/// Kube client connect timeout in seconds
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "PODLAB_CONNECT_TIMEOUT_SECS";
/// Kube client read timeout in seconds
pub const ENV_READ_TIMEOUT_SECS: &str = "PODLAB_READ_TIMEOUT_SECS";

/// Default prefix for generated namespace names
pub const DEFAULT_NAMESPACE_PREFIX: &str = "podlab";

/// How client code outside the cluster reaches a workload's primary port
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccessMode {
    /// Local listener relayed through the API server
    #[default]
    PortForward,
    /// Node address plus the service's node port
    NodePort,
    /// Ingress address assigned to a LoadBalancer service
    LoadBalancer,
}

impl FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "port-forward" | "portforward" => Ok(Self::PortForward),
            "node-port" | "nodeport" => Ok(Self::NodePort),
            "load-balancer" | "loadbalancer" => Ok(Self::LoadBalancer),
            other => Err(Error::validation_for_field(
                ENV_ACCESS_STRATEGY,
                format!(
                    "unknown access strategy '{}' (expected port-forward, node-port or load-balancer)",
                    other
                ),
            )),
        }
    }
}

/// Resolved process configuration
#[derive(Clone, Debug, PartialEq)]
pub struct PodlabConfig {
    /// Explicit kubeconfig path
    pub kubeconfig: Option<PathBuf>,
    /// Prefix for generated namespace names
    pub namespace_prefix: String,
    /// External access mode
    pub access_mode: AccessMode,
    /// Node address for node-port access
    pub node_host: Option<String>,
    /// Kube client connect timeout
    pub connect_timeout: Duration,
    /// Kube client read timeout
    pub read_timeout: Duration,
}

impl Default for PodlabConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            access_mode: AccessMode::default(),
            node_host: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl PodlabConfig {
    /// Resolve from the process environment
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary key lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let access_mode = match get(ENV_ACCESS_STRATEGY) {
            Some(v) => v.parse()?,
            None => defaults.access_mode,
        };

        Ok(Self {
            kubeconfig: get(ENV_KUBECONFIG).map(PathBuf::from),
            namespace_prefix: get(ENV_NAMESPACE_PREFIX).unwrap_or(defaults.namespace_prefix),
            access_mode,
            node_host: get(ENV_NODE_HOST),
            connect_timeout: parse_secs(get(ENV_CONNECT_TIMEOUT_SECS), ENV_CONNECT_TIMEOUT_SECS)?
                .unwrap_or(defaults.connect_timeout),
            read_timeout: parse_secs(get(ENV_READ_TIMEOUT_SECS), ENV_READ_TIMEOUT_SECS)?
                .unwrap_or(defaults.read_timeout),
        })
    }
}

fn parse_secs(value: Option<String>, key: &str) -> Result<Option<Duration>, Error> {
    value
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| {
                    Error::validation_for_field(key, format!("'{}' is not a number of seconds", v))
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = PodlabConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PodlabConfig::default());
        assert_eq!(config.namespace_prefix, "podlab");
        assert_eq!(config.access_mode, AccessMode::PortForward);
    }

    #[test]
    fn every_variable_is_honored() {
        let config = PodlabConfig::from_lookup(lookup(&[
            (ENV_KUBECONFIG, "/tmp/kind.yaml"),
            (ENV_NAMESPACE_PREFIX, "it"),
            (ENV_ACCESS_STRATEGY, "NodePort"),
            (ENV_NODE_HOST, "172.18.0.2"),
            (ENV_CONNECT_TIMEOUT_SECS, "2"),
            (ENV_READ_TIMEOUT_SECS, "10"),
        ]))
        .unwrap();

        assert_eq!(config.kubeconfig, Some(PathBuf::from("/tmp/kind.yaml")));
        assert_eq!(config.namespace_prefix, "it");
        assert_eq!(config.access_mode, AccessMode::NodePort);
        assert_eq!(config.node_host.as_deref(), Some("172.18.0.2"));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.read_timeout, Duration::from_secs(10));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config =
            PodlabConfig::from_lookup(lookup(&[(ENV_NAMESPACE_PREFIX, "  "), (ENV_NODE_HOST, "")]))
                .unwrap();
        assert_eq!(config.namespace_prefix, DEFAULT_NAMESPACE_PREFIX);
        assert_eq!(config.node_host, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = PodlabConfig::from_lookup(lookup(&[(ENV_ACCESS_STRATEGY, "ingress")]))
            .unwrap_err();
        assert!(err.to_string().contains("unknown access strategy 'ingress'"));

        let err = PodlabConfig::from_lookup(lookup(&[(ENV_READ_TIMEOUT_SECS, "soon")]))
            .unwrap_err();
        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some(ENV_READ_TIMEOUT_SECS))
            }
            other => panic!("Expected Validation variant, got {other:?}"),
        }
    }

    #[test]
    fn access_mode_accepts_both_spellings() {
        assert_eq!("port-forward".parse::<AccessMode>().unwrap(), AccessMode::PortForward);
        assert_eq!("load-balancer".parse::<AccessMode>().unwrap(), AccessMode::LoadBalancer);
        assert_eq!("LoadBalancer".parse::<AccessMode>().unwrap(), AccessMode::LoadBalancer);
    }
}
