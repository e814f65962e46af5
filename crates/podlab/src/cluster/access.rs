//! How test code outside the cluster reaches a workload

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info};

use super::client::{ClusterClient, PortForward};
use crate::host::{HostAndPort, LOOPBACK};
use podlab_common::config::{AccessMode, PodlabConfig};
use podlab_common::kube_utils::{format_duration, poll_until, PollState};
use podlab_common::{Error, Result};

/// Default wait for a load balancer to receive an address
pub const DEFAULT_LOAD_BALANCER_TIMEOUT: Duration = Duration::from_secs(120);
const LOAD_BALANCER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Strategy for exposing a workload's primary port to the test process
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessStrategy {
    /// Local listener relayed through the API server
    #[default]
    PortForward,
    /// Node address plus the Service's node port
    NodePort {
        /// Node address; the first node's InternalIP when unset
        host: Option<String>,
    },
    /// Ingress address of a LoadBalancer Service
    LoadBalancer {
        /// How long to wait for an ingress address
        timeout: Duration,
    },
}

impl AccessStrategy {
    /// Strategy selected by the process configuration
    pub fn from_config(config: &PodlabConfig) -> Self {
        match config.access_mode {
            AccessMode::PortForward => Self::PortForward,
            AccessMode::NodePort => Self::NodePort {
                host: config.node_host.clone(),
            },
            AccessMode::LoadBalancer => Self::LoadBalancer {
                timeout: DEFAULT_LOAD_BALANCER_TIMEOUT,
            },
        }
    }

    /// Service type a routable endpoint needs under this strategy
    pub fn service_type(&self) -> &'static str {
        match self {
            AccessStrategy::PortForward => "ClusterIP",
            AccessStrategy::NodePort { .. } => "NodePort",
            AccessStrategy::LoadBalancer { .. } => "LoadBalancer",
        }
    }

    /// Resolve the client-reachable address for `target`.
    ///
    /// Headless endpoints have no node port or ingress, so they are always
    /// port-forwarded.
    pub async fn resolve(
        &self,
        client: &dyn ClusterClient,
        target: &EndpointTarget,
    ) -> Result<ExternalEndpoint> {
        let strategy = if target.headless {
            &AccessStrategy::PortForward
        } else {
            self
        };

        match strategy {
            AccessStrategy::PortForward => {
                let forward = client
                    .port_forward(&target.namespace, &target.selector, target.port)
                    .await?;
                Ok(ExternalEndpoint {
                    address: forward.local_address().clone(),
                    forward: Some(forward),
                })
            }
            AccessStrategy::NodePort { host } => {
                let node_port = node_port(client, target).await?;
                let host = match host {
                    Some(h) => h.clone(),
                    None => client
                        .node_internal_ip()
                        .await?
                        .unwrap_or_else(|| LOOPBACK.to_string()),
                };
                debug!(service = %target.service, host = %host, node_port, "resolved node port");
                Ok(ExternalEndpoint::direct(HostAndPort::new(host, node_port)))
            }
            AccessStrategy::LoadBalancer { timeout } => {
                let host = load_balancer_host(client, target, *timeout).await?;
                info!(service = %target.service, host = %host, "load balancer address assigned");
                Ok(ExternalEndpoint::direct(HostAndPort::new(host, target.port)))
            }
        }
    }
}

/// The endpoint Service and pod selector to expose
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointTarget {
    /// Namespace of the Service
    pub namespace: String,
    /// Service name
    pub service: String,
    /// Pod label selector, e.g. `app=web`
    pub selector: String,
    /// Service (and container) port
    pub port: u16,
    /// The Service has no cluster IP
    pub headless: bool,
}

/// A resolved external address, holding the relay alive if one was needed
#[derive(Debug)]
pub struct ExternalEndpoint {
    address: HostAndPort,
    forward: Option<PortForward>,
}

impl ExternalEndpoint {
    /// Address reachable without a relay
    pub fn direct(address: HostAndPort) -> Self {
        Self {
            address,
            forward: None,
        }
    }

    /// Address clients connect to
    pub fn address(&self) -> &HostAndPort {
        &self.address
    }

    /// Whether a port-forward relay backs this address
    pub fn is_forwarded(&self) -> bool {
        self.forward.is_some()
    }
}

async fn node_port(client: &dyn ClusterClient, target: &EndpointTarget) -> Result<u16> {
    let service = client
        .get_service(&target.namespace, &target.service)
        .await?
        .ok_or_else(|| Error::not_found("Service", &target.service))?;

    service
        .spec
        .and_then(|s| s.ports)
        .unwrap_or_default()
        .into_iter()
        .find(|p| p.port == i32::from(target.port))
        .and_then(|p| p.node_port)
        .and_then(|np| u16::try_from(np).ok())
        .ok_or_else(|| {
            Error::not_found(
                "NodePort",
                format!("{}:{}", target.service, target.port),
            )
        })
}

async fn load_balancer_host(
    client: &dyn ClusterClient,
    target: &EndpointTarget,
    timeout: Duration,
) -> Result<String> {
    let found = Mutex::new(None::<String>);

    let outcome = poll_until(timeout, LOAD_BALANCER_POLL_INTERVAL, || {
        let found = &found;
        async move {
            let service = client
                .get_service(&target.namespace, &target.service)
                .await?;
            let Some(service) = service else {
                return Ok(PollState::Gone(format!("service {} deleted", target.service)));
            };
            let ingress = service
                .status
                .and_then(|s| s.load_balancer)
                .and_then(|lb| lb.ingress)
                .unwrap_or_default()
                .into_iter()
                .find_map(|i| i.ip.or(i.hostname));
            match ingress {
                Some(host) => {
                    if let Ok(mut slot) = found.lock() {
                        *slot = Some(host);
                    }
                    Ok(PollState::Ready)
                }
                None => Ok(PollState::Pending("no ingress address yet".to_string())),
            }
        }
    })
    .await;

    if let Err(timeout) = outcome {
        return Err(Error::internal_with_context(
            "load_balancer",
            format!(
                "service {} got no ingress address within {}: {}",
                target.service,
                format_duration(timeout.elapsed),
                timeout.last_state
            ),
        ));
    }

    found
        .into_inner()
        .ok()
        .flatten()
        .ok_or_else(|| Error::internal_with_context("load_balancer", "ingress address lost"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::client::MockClusterClient;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, Service, ServicePort, ServiceSpec, ServiceStatus,
    };

    fn target(headless: bool) -> EndpointTarget {
        EndpointTarget {
            namespace: "ns-1".to_string(),
            service: "web".to_string(),
            selector: "app=web".to_string(),
            port: 8080,
            headless,
        }
    }

    fn service_with_node_port(node_port: i32) -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 8080,
                    node_port: Some(node_port),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn port_forward_uses_the_local_relay_address() {
        let mut mock = MockClusterClient::new();
        mock.expect_port_forward()
            .withf(|ns: &str, sel: &str, port: &u16| ns == "ns-1" && sel == "app=web" && *port == 8080)
            .times(1)
            .returning(|_, _, _| Ok(PortForward::detached(HostAndPort::localhost(41234))));

        let endpoint = AccessStrategy::PortForward
            .resolve(&mock, &target(false))
            .await
            .unwrap();
        assert_eq!(endpoint.address().to_string(), "127.0.0.1:41234");
        assert!(endpoint.is_forwarded());
    }

    #[tokio::test]
    async fn node_port_prefers_explicit_host() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_service()
            .returning(|_, _| Ok(Some(service_with_node_port(30080))));
        mock.expect_node_internal_ip().never();

        let strategy = AccessStrategy::NodePort {
            host: Some("172.18.0.2".to_string()),
        };
        let endpoint = strategy.resolve(&mock, &target(false)).await.unwrap();
        assert_eq!(endpoint.address().to_string(), "172.18.0.2:30080");
        assert!(!endpoint.is_forwarded());
    }

    #[tokio::test]
    async fn node_port_falls_back_to_loopback_without_node_address() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_service()
            .returning(|_, _| Ok(Some(service_with_node_port(31000))));
        mock.expect_node_internal_ip().returning(|| Ok(None));

        let endpoint = AccessStrategy::NodePort { host: None }
            .resolve(&mock, &target(false))
            .await
            .unwrap();
        assert_eq!(endpoint.address().to_string(), "127.0.0.1:31000");
    }

    #[tokio::test]
    async fn headless_endpoints_are_always_forwarded() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_service().never();
        mock.expect_port_forward()
            .times(1)
            .returning(|_, _, _| Ok(PortForward::detached(HostAndPort::localhost(40000))));

        let endpoint = AccessStrategy::NodePort { host: None }
            .resolve(&mock, &target(true))
            .await
            .unwrap();
        assert!(endpoint.is_forwarded());
    }

    #[tokio::test(start_paused = true)]
    async fn load_balancer_waits_for_ingress() {
        let mut mock = MockClusterClient::new();
        let mut calls = 0;
        mock.expect_get_service().returning(move |_, _| {
            calls += 1;
            let ingress = (calls > 1).then(|| {
                vec![LoadBalancerIngress {
                    ip: Some("10.0.0.7".to_string()),
                    ..Default::default()
                }]
            });
            Ok(Some(Service {
                status: Some(ServiceStatus {
                    load_balancer: Some(LoadBalancerStatus { ingress }),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });

        let endpoint = AccessStrategy::LoadBalancer {
            timeout: Duration::from_secs(10),
        }
        .resolve(&mock, &target(false))
        .await
        .unwrap();
        assert_eq!(endpoint.address().to_string(), "10.0.0.7:8080");
    }

    #[test]
    fn strategy_follows_configuration() {
        let config = PodlabConfig {
            access_mode: AccessMode::NodePort,
            node_host: Some("node-1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            AccessStrategy::from_config(&config),
            AccessStrategy::NodePort {
                host: Some("node-1".to_string())
            }
        );
        assert_eq!(AccessStrategy::default().service_type(), "ClusterIP");
    }
}
