//! Kubernetes client construction and the polling loop used by every
//! readiness check.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
///
/// Without a path, kube's inference chain applies: `KUBECONFIG`,
/// `~/.kube/config`, then the in-cluster service account.
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Result of a single polling check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollState {
    /// Condition met, stop polling
    Ready,
    /// Not there yet; the string describes what was observed
    Pending(String),
    /// The polled object vanished; polling cannot succeed anymore
    Gone(String),
}

/// Polling gave up before the condition was met
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollTimeout {
    /// Time spent polling
    pub elapsed: Duration,
    /// Description of the last observation
    pub last_state: String,
    /// True when polling stopped early because the target disappeared
    pub gone: bool,
}

/// Poll until a condition is met or the timeout expires.
///
/// The check runs at least once. Errors returned by the check are treated
/// as "not ready yet" and recorded as the last observed state. A
/// [`PollState::Gone`] answer ends polling immediately with a timeout.
///
/// Returns the elapsed time on success.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    mut check_fn: F,
) -> Result<Duration, PollTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState, Error>>,
{
    let start = Instant::now();
    let mut last_state = String::from("not yet polled");

    loop {
        match check_fn().await {
            Ok(PollState::Ready) => return Ok(start.elapsed()),
            Ok(PollState::Pending(state)) => {
                trace!(state = %state, "Polling condition not yet met, retrying...");
                last_state = state;
            }
            Ok(PollState::Gone(state)) => {
                return Err(PollTimeout {
                    elapsed: start.elapsed(),
                    last_state: state,
                    gone: true,
                });
            }
            Err(e) => {
                trace!(error = %e, "Polling check returned error (retrying)");
                last_state = format!("check failed: {}", e);
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(PollTimeout {
                elapsed,
                last_state,
                gone: false,
            });
        }

        tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
    }
}

/// Format a duration the way test output reads best: `45s`, `2m`, `1m 30s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn poll_until_returns_once_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = poll_until(Duration::from_secs(5), Duration::from_millis(1), move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    Ok(PollState::Ready)
                } else {
                    Ok(PollState::Pending(format!("attempt {}", n)))
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_reports_last_state_on_timeout() {
        let result = poll_until(Duration::from_millis(30), Duration::from_millis(5), || async {
            Ok(PollState::Pending("0/1 ready".to_string()))
        })
        .await;

        let timeout = result.expect_err("should time out");
        assert_eq!(timeout.last_state, "0/1 ready");
        assert!(!timeout.gone);
        assert!(timeout.elapsed >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn poll_until_checks_at_least_once_with_zero_timeout() {
        let result = poll_until(Duration::ZERO, Duration::from_millis(5), || async {
            Ok(PollState::Ready)
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn poll_until_stops_immediately_when_target_is_gone() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = poll_until(Duration::from_secs(60), Duration::from_millis(1), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(PollState::Gone("deployment deleted".to_string())) }
        })
        .await;

        let timeout = result.expect_err("gone is a timeout");
        assert!(timeout.gone);
        assert_eq!(timeout.last_state, "deployment deleted");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_until_records_check_errors_as_state() {
        let result = poll_until(Duration::from_millis(10), Duration::from_millis(2), || async {
            Err(Error::internal("connection refused"))
        })
        .await;

        let timeout = result.expect_err("errors never satisfy the condition");
        assert!(timeout.last_state.contains("connection refused"));
    }

    #[test]
    fn durations_format_in_minutes_and_seconds() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_millis(999)), "0s");
    }
}
