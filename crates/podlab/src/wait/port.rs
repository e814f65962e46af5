use std::time::Duration;

use tokio::net::TcpStream;

use podlab_common::kube_utils::{poll_until, PollState, PollTimeout};

use super::{WaitTarget, DEFAULT_TIMEOUT};

/// Waits until a TCP connection to the external address succeeds
#[derive(Clone, Debug)]
pub struct PortWait {
    /// Deadline
    pub timeout: Duration,
    /// Interval between attempts
    pub poll_interval: Duration,
    /// Limit for a single connection attempt
    pub connect_timeout: Duration,
}

impl Default for PortWait {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl PortWait {
    pub(super) async fn wait(
        &self,
        target: &dyn WaitTarget,
        timeout: Duration,
    ) -> Result<Duration, PollTimeout> {
        poll_until(timeout, self.poll_interval, || async {
            let Some(address) = target.external_address().await? else {
                return Ok(PollState::Pending("no external address".to_string()));
            };
            let attempt =
                tokio::time::timeout(self.connect_timeout, TcpStream::connect(address.to_string()))
                    .await;
            Ok(match attempt {
                Ok(Ok(_)) => PollState::Ready,
                Ok(Err(e)) => PollState::Pending(format!("{}: {}", address, e)),
                Err(_) => PollState::Pending(format!("{}: connect timed out", address)),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::FakeTarget;
    use super::super::WaitStrategy;
    use super::*;
    use crate::host::HostAndPort;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn ready_once_something_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut target = FakeTarget::with_statuses(vec![]);
        target.address = Some(HostAndPort::localhost(port));

        let strategy = WaitStrategy::port().with_timeout(Duration::from_secs(2));
        assert!(strategy.wait_until_ready(&target).await.is_ok());
    }

    #[tokio::test]
    async fn closed_port_times_out() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut target = FakeTarget::with_statuses(vec![]);
        target.address = Some(HostAndPort::localhost(port));

        let strategy = WaitStrategy::port()
            .with_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(10));
        let err = strategy.wait_until_ready(&target).await.unwrap_err();
        assert!(err.last_state.starts_with(&format!("127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn missing_address_is_pending() {
        let target = FakeTarget::with_statuses(vec![]);
        let strategy = WaitStrategy::port()
            .with_timeout(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(5));
        let err = strategy.wait_until_ready(&target).await.unwrap_err();
        assert_eq!(err.last_state, "no external address");
    }
}
