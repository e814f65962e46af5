//! Readiness strategies
//!
//! Every strategy polls one predicate on a fixed interval until it holds or
//! the deadline passes. [`WaitStrategy::AllOf`] runs several in order
//! under one shared deadline.

mod command;
mod http;
mod log;
mod port;
mod probe;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info};

pub use command::CommandWait;
pub use http::HttpWait;
pub use log::LogMessageWait;
pub use port::PortWait;
pub use probe::ReadinessProbeWait;

use crate::cluster::{ExecCommand, ExecResult, ReplicaStatus};
use crate::error::ReadinessTimeout;
use crate::host::HostAndPort;
use podlab_common::kube_utils::PollTimeout;
use podlab_common::Result;

/// Default deadline for a single strategy
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default deadline for a composite strategy
pub const DEFAULT_COMPOSITE_TIMEOUT: Duration = Duration::from_secs(300);

/// What a strategy observes while waiting
#[async_trait]
pub trait WaitTarget: Send + Sync {
    /// Pod name, for error messages
    fn pod_name(&self) -> &str;

    /// Workload replica status, `None` when the workload does not exist
    async fn replica_status(&self) -> Result<Option<ReplicaStatus>>;

    /// Logs of the workload's first pod
    async fn logs(&self) -> Result<Option<String>>;

    /// Run a command in the workload's first running pod
    async fn exec(&self, command: &ExecCommand) -> Result<ExecResult>;

    /// Client-reachable address of the primary port, `None` while unknown
    async fn external_address(&self) -> Result<Option<HostAndPort>>;
}

/// A readiness strategy with its deadline
#[derive(Clone, Debug)]
pub enum WaitStrategy {
    /// Ready-replica count equals desired count
    ReadinessProbe(ReadinessProbeWait),
    /// TCP connect to the external address succeeds
    Port(PortWait),
    /// HTTP request answers with an expected status
    Http(HttpWait),
    /// Workload logs match a pattern
    LogMessage(LogMessageWait),
    /// A command run inside the workload exits zero
    Command(CommandWait),
    /// Each child in order, under one deadline
    AllOf(CompositeWait),
}

impl WaitStrategy {
    /// Wait for the platform readiness probe
    pub fn readiness_probe() -> Self {
        Self::ReadinessProbe(ReadinessProbeWait::default())
    }

    /// Wait for the primary port to accept connections
    pub fn port() -> Self {
        Self::Port(PortWait::default())
    }

    /// Wait for `GET path` to answer 2xx
    pub fn http(path: &str) -> Self {
        Self::Http(HttpWait::new(path))
    }

    /// Wait for a log line matching `pattern` (multi-line regex)
    pub fn log_message(pattern: &str) -> Result<Self> {
        Ok(Self::LogMessage(LogMessageWait::new(pattern)?))
    }

    /// Wait for `command` to exit zero inside the workload
    pub fn command<I, S>(command: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self::Command(CommandWait::new(command)?))
    }

    /// Run `strategies` in order under one deadline
    pub fn all_of(strategies: Vec<WaitStrategy>) -> Self {
        Self::AllOf(CompositeWait {
            strategies,
            timeout: DEFAULT_COMPOSITE_TIMEOUT,
        })
    }

    /// Override the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        match &mut self {
            Self::ReadinessProbe(s) => s.timeout = timeout,
            Self::Port(s) => s.timeout = timeout,
            Self::Http(s) => s.timeout = timeout,
            Self::LogMessage(s) => s.timeout = timeout,
            Self::Command(s) => s.timeout = timeout,
            Self::AllOf(s) => s.timeout = timeout,
        }
        self
    }

    /// Override the polling interval (ignored by composites)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        match &mut self {
            Self::ReadinessProbe(s) => s.poll_interval = interval,
            Self::Port(s) => s.poll_interval = interval,
            Self::Http(s) => s.poll_interval = interval,
            Self::LogMessage(s) => s.poll_interval = interval,
            Self::Command(s) => s.poll_interval = interval,
            Self::AllOf(_) => {}
        }
        self
    }

    /// Deadline
    pub fn timeout(&self) -> Duration {
        match self {
            Self::ReadinessProbe(s) => s.timeout,
            Self::Port(s) => s.timeout,
            Self::Http(s) => s.timeout,
            Self::LogMessage(s) => s.timeout,
            Self::Command(s) => s.timeout,
            Self::AllOf(s) => s.timeout,
        }
    }

    /// Short description for logs and errors
    pub fn describe(&self) -> String {
        match self {
            Self::ReadinessProbe(_) => "readiness probe".to_string(),
            Self::Port(_) => "port".to_string(),
            Self::Http(s) => format!("http {} {}", s.method, s.path),
            Self::LogMessage(s) => format!("log message /{}/", s.pattern.as_str()),
            Self::Command(s) => match &s.command.container {
                Some(container) => format!("command '{}' in {}", s.command.display(), container),
                None => format!("command '{}'", s.command.display()),
            },
            Self::AllOf(s) => format!(
                "all of [{}]",
                s.strategies
                    .iter()
                    .map(WaitStrategy::describe)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    /// Block until `target` is ready or the deadline passes
    pub async fn wait_until_ready(&self, target: &dyn WaitTarget) -> std::result::Result<Duration, ReadinessTimeout> {
        info!(pod = %target.pod_name(), strategy = %self.describe(), "waiting for readiness");
        let elapsed = self.wait_within(target, self.timeout()).await?;
        info!(pod = %target.pod_name(), elapsed_ms = elapsed.as_millis() as u64, "pod is ready");
        Ok(elapsed)
    }

    fn wait_within<'a>(
        &'a self,
        target: &'a dyn WaitTarget,
        budget: Duration,
    ) -> BoxFuture<'a, std::result::Result<Duration, ReadinessTimeout>> {
        async move {
            let timeout = self.timeout().min(budget);
            let outcome = match self {
                Self::ReadinessProbe(s) => s.wait(target, timeout).await,
                Self::Port(s) => s.wait(target, timeout).await,
                Self::Http(s) => s.wait(target, timeout).await,
                Self::LogMessage(s) => s.wait(target, timeout).await,
                Self::Command(s) => s.wait(target, timeout).await,
                Self::AllOf(s) => return s.wait(target, timeout).await,
            };
            outcome.map_err(|t| self.timed_out(target, t))
        }
        .boxed()
    }

    fn timed_out(&self, target: &dyn WaitTarget, timeout: PollTimeout) -> ReadinessTimeout {
        ReadinessTimeout {
            pod: target.pod_name().to_string(),
            strategy: self.describe(),
            elapsed: timeout.elapsed,
            last_state: timeout.last_state,
        }
    }
}

/// Children run in order; each gets whatever time the earlier ones left
#[derive(Clone, Debug)]
pub struct CompositeWait {
    /// Strategies in execution order
    pub strategies: Vec<WaitStrategy>,
    /// Shared deadline
    pub timeout: Duration,
}

impl CompositeWait {
    async fn wait(
        &self,
        target: &dyn WaitTarget,
        timeout: Duration,
    ) -> std::result::Result<Duration, ReadinessTimeout> {
        let start = Instant::now();
        let total = self.strategies.len();

        for (i, strategy) in self.strategies.iter().enumerate() {
            let remaining = timeout.saturating_sub(start.elapsed());
            debug!(
                pod = %target.pod_name(),
                step = i + 1,
                of = total,
                strategy = %strategy.describe(),
                "running wait strategy"
            );
            if let Err(mut t) = strategy.wait_within(target, remaining).await {
                t.strategy = format!("strategy {} of {} ({})", i + 1, total, t.strategy);
                t.elapsed = start.elapsed();
                return Err(t);
            }
        }
        Ok(start.elapsed())
    }
}
