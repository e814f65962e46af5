//! [`ClusterClient`] backed by a real API server via kube-rs

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, ObjectMeta, PostParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::client::{
    ClusterClient, ExecCommand, ExecResult, LogOptions, ManagedResource, PortForward,
    ReplicaStatus, ResourceKind, ResourceRef, WorkloadKind,
};
use crate::host::HostAndPort;
use podlab_common::config::PodlabConfig;
use podlab_common::kube_utils::create_client_with_timeout;
use podlab_common::retry::{retry_with_backoff_if, RetryConfig};
use podlab_common::{Error, Result};

/// Production client; connects on first use
pub struct KubeClusterClient {
    config: PodlabConfig,
    client: OnceCell<Client>,
}

impl KubeClusterClient {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self {
            config: PodlabConfig::default(),
            client: OnceCell::new_with(Some(client)),
        }
    }

    /// Defer connecting until the first call, using `config` for kubeconfig
    /// location and timeouts
    pub fn lazy(config: PodlabConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                debug!(kubeconfig = ?self.config.kubeconfig, "connecting to cluster");
                create_client_with_timeout(
                    self.config.kubeconfig.as_deref(),
                    self.config.connect_timeout,
                    self.config.read_timeout,
                )
                .await
            })
            .await?;
        Ok(client.clone())
    }

    /// Name of the first running pod matching `selector`; retried while the
    /// scheduler catches up
    async fn running_pod(&self, pods: &Api<Pod>, selector: &str) -> Result<String> {
        retry_with_backoff_if(
            &RetryConfig::default(),
            "find_running_pod",
            Error::is_not_found,
            || async {
                let list = pods.list(&ListParams::default().labels(selector)).await?;
                list.items
                    .into_iter()
                    .find(|p| {
                        p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
                    })
                    .and_then(|p| p.metadata.name)
                    .ok_or_else(|| Error::not_found("Pod", selector))
            },
        )
        .await
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns).await?;
        info!(namespace = %name, "created namespace");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        api.delete(name, &DeleteParams::background()).await?;
        info!(namespace = %name, "deleted namespace");
        Ok(())
    }

    async fn create(&self, resource: &ManagedResource) -> Result<()> {
        let client = self.client().await?;
        let target = resource.resource_ref()?;
        let pp = PostParams::default();
        let ns = target.namespace.as_str();

        match resource {
            ManagedResource::ConfigMap(r) => {
                Api::<ConfigMap>::namespaced(client, ns).create(&pp, r).await?;
            }
            ManagedResource::Deployment(r) => {
                Api::<Deployment>::namespaced(client, ns).create(&pp, r).await?;
            }
            ManagedResource::StatefulSet(r) => {
                Api::<StatefulSet>::namespaced(client, ns).create(&pp, r).await?;
            }
            ManagedResource::Service(r) => {
                Api::<Service>::namespaced(client, ns).create(&pp, r).await?;
            }
        }
        debug!(resource = %target, "created");
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        let client = self.client().await?;
        let dp = DeleteParams::background();
        let (ns, name) = (resource.namespace.as_str(), resource.name.as_str());

        match resource.kind {
            ResourceKind::ConfigMap => {
                Api::<ConfigMap>::namespaced(client, ns).delete(name, &dp).await?;
            }
            ResourceKind::Deployment => {
                Api::<Deployment>::namespaced(client, ns).delete(name, &dp).await?;
            }
            ResourceKind::StatefulSet => {
                Api::<StatefulSet>::namespaced(client, ns).delete(name, &dp).await?;
            }
            ResourceKind::Service => {
                Api::<Service>::namespaced(client, ns).delete(name, &dp).await?;
            }
        }
        debug!(resource = %resource, "deleted");
        Ok(())
    }

    async fn workload_status(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaStatus>> {
        let client = self.client().await?;
        let status = match kind {
            WorkloadKind::Stateless => Api::<Deployment>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(|d| {
                    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    let status = d.status.unwrap_or_default();
                    ReplicaStatus {
                        desired,
                        current: status.replicas.unwrap_or(0),
                        ready: status.ready_replicas.unwrap_or(0),
                    }
                }),
            WorkloadKind::StableIdentity => Api::<StatefulSet>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(|s| {
                    let desired = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    let status = s.status.unwrap_or_default();
                    ReplicaStatus {
                        desired,
                        current: status.replicas,
                        ready: status.ready_replicas.unwrap_or(0),
                    }
                }),
        };
        Ok(status)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client().await?, namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        selector: &str,
        options: &LogOptions,
    ) -> Result<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client().await?, namespace);
        let mut names: Vec<String> = pods
            .list(&ListParams::default().labels(selector))
            .await?
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect();
        names.sort();

        let Some(first) = names.first() else {
            return Ok(None);
        };
        let params = LogParams {
            container: options.container.clone(),
            since_seconds: options.since.map(whole_seconds),
            ..Default::default()
        };
        match pods.logs(first, &params).await {
            Ok(logs) => Ok(Some(logs)),
            // Container not started yet
            Err(kube::Error::Api(ae)) if ae.code == 400 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(
        &self,
        namespace: &str,
        selector: &str,
        command: &ExecCommand,
    ) -> Result<ExecResult> {
        if command.command.is_empty() {
            return Err(Error::validation_for_field("command", "command must not be empty"));
        }
        let pods: Api<Pod> = Api::namespaced(self.client().await?, namespace);
        let pod_name = self.running_pod(&pods, selector).await?;

        let params = AttachParams {
            container: command.container.clone(),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };
        debug!(pod = %pod_name, command = %command.display(), "exec");
        let mut attached = pods.exec(&pod_name, command.command.clone(), &params).await?;

        let status = attached.take_status();
        let (stdout, stderr) = tokio::join!(
            read_stream(attached.stdout()),
            read_stream(attached.stderr())
        );
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::internal_with_context("exec", e.to_string()))?;

        Ok(ExecResult {
            exit_code: exit_code(status.as_ref())?,
            stdout: stdout?,
            stderr: stderr?,
        })
    }

    async fn node_internal_ip(&self) -> Result<Option<String>> {
        let nodes: Api<Node> = Api::all(self.client().await?);
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|n| n.status.and_then(|s| s.addresses))
            .flatten()
            .find(|a| a.type_ == "InternalIP")
            .map(|a| a.address))
    }

    async fn port_forward(
        &self,
        namespace: &str,
        selector: &str,
        port: u16,
    ) -> Result<PortForward> {
        let pods: Api<Pod> = Api::namespaced(self.client().await?, namespace);
        let pod_name = self.running_pod(&pods, selector).await?;

        let listener = TcpListener::bind((crate::host::LOOPBACK, 0))
            .await
            .map_err(|e| Error::internal_with_context("port_forward", e.to_string()))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::internal_with_context("port_forward", e.to_string()))?;

        info!(
            pod = %pod_name,
            namespace = %namespace,
            port = port,
            local = %local,
            "forwarding local port"
        );

        let relay = tokio::spawn(accept_loop(listener, pods, pod_name, port));
        Ok(PortForward::new(
            HostAndPort::localhost(local.port()),
            relay,
        ))
    }
}

/// The log API counts whole seconds; round up so the window is never shorter
fn whole_seconds(window: std::time::Duration) -> i64 {
    let secs = window.as_secs() + u64::from(window.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

async fn read_stream(stream: Option<impl AsyncRead + Unpin>) -> Result<String> {
    let Some(mut stream) = stream else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(|e| Error::internal_with_context("exec", e.to_string()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Exit code from the status frame the API sends when an exec ends
fn exit_code(status: Option<&Status>) -> Result<i32> {
    let Some(status) = status else {
        return Err(Error::internal_with_context("exec", "no exit status received"));
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }
    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .into_iter()
            .flatten()
            .find(|c| c.reason.as_deref() == Some("ExitCode"))
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.parse().ok());
        if let Some(code) = code {
            return Ok(code);
        }
    }
    Err(Error::internal_with_context(
        "exec",
        status
            .message
            .clone()
            .unwrap_or_else(|| "command failed without an exit code".to_string()),
    ))
}

async fn accept_loop(listener: TcpListener, pods: Api<Pod>, pod_name: String, port: u16) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, pod = %pod_name, "port-forward listener failed");
                return;
            }
        };
        let pods = pods.clone();
        let pod_name = pod_name.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_connection(&pods, &pod_name, port, socket).await {
                debug!(error = %e, peer = %peer, pod = %pod_name, "port-forward connection ended");
            }
        });
    }
}

async fn relay_connection(
    pods: &Api<Pod>,
    pod_name: &str,
    port: u16,
    mut socket: TcpStream,
) -> Result<()> {
    let mut forwarder = pods.portforward(pod_name, &[port]).await?;
    let mut upstream = forwarder.take_stream(port).ok_or_else(|| {
        Error::internal_with_context("port_forward", format!("no stream for port {}", port))
    })?;

    tokio::io::copy_bidirectional(&mut socket, &mut upstream)
        .await
        .map_err(|e| Error::internal_with_context("port_forward", e.to_string()))?;

    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| Error::internal_with_context("port_forward", e.to_string()))
}
