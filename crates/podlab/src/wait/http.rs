use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;
use reqwest::Method;

use podlab_common::kube_utils::{poll_until, PollState, PollTimeout};
use podlab_common::Error;

use super::{WaitTarget, DEFAULT_TIMEOUT};

/// Status codes accepted when none are configured
pub const DEFAULT_EXPECTED_STATUS: [u16; 4] = [200, 201, 202, 204];

/// Waits until an HTTP request to the external address gets an expected answer
#[derive(Clone, Debug)]
pub struct HttpWait {
    /// Request path, always starting with `/`
    pub path: String,
    /// Request method
    pub method: Method,
    /// Accepted status codes
    pub expected_status: BTreeSet<u16>,
    /// Optional pattern the response body must match
    pub body_pattern: Option<Regex>,
    /// Use https
    pub tls: bool,
    /// Accept self-signed certificates (only with `tls`)
    pub insecure: bool,
    /// Deadline
    pub timeout: Duration,
    /// Interval between requests
    pub poll_interval: Duration,
    /// Limit for a single request
    pub read_timeout: Duration,
}

impl HttpWait {
    /// `GET path` expecting one of [`DEFAULT_EXPECTED_STATUS`]
    pub fn new(path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self {
            path,
            method: Method::GET,
            expected_status: DEFAULT_EXPECTED_STATUS.into_iter().collect(),
            body_pattern: None,
            tls: false,
            insecure: false,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: Duration::from_secs(1),
            read_timeout: Duration::from_secs(5),
        }
    }

    /// Accept exactly these status codes
    pub fn with_status(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.expected_status = codes.into_iter().collect();
        self
    }

    /// Use a different method (e.g. `HEAD`)
    pub fn with_method(mut self, method: &str) -> Result<Self, Error> {
        self.method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
            Error::validation_for_field("method", format!("invalid http method '{}'", method))
        })?;
        Ok(self)
    }

    /// Require the body to match `pattern`
    pub fn with_body_matching(mut self, pattern: &str) -> Result<Self, Error> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::validation_for_field("body_pattern", e.to_string()))?;
        self.body_pattern = Some(regex);
        Ok(self)
    }

    /// Use https; `insecure` skips certificate verification
    pub fn with_tls(mut self, insecure: bool) -> Self {
        self.tls = true;
        self.insecure = insecure;
        self
    }

    pub(super) async fn wait(
        &self,
        target: &dyn WaitTarget,
        timeout: Duration,
    ) -> Result<Duration, PollTimeout> {
        let client = match reqwest::Client::builder()
            .timeout(self.read_timeout)
            .danger_accept_invalid_certs(self.insecure)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                return Err(PollTimeout {
                    elapsed: Duration::ZERO,
                    last_state: format!("could not build http client: {}", e),
                    gone: false,
                })
            }
        };
        poll_until(timeout, self.poll_interval, || {
            let client = &client;
            let method = self.method.clone();
            async move {
                let Some(address) = target.external_address().await? else {
                    return Ok(PollState::Pending("no external address".to_string()));
                };
                let base = if self.tls {
                    address.https_url()
                } else {
                    address.http_url()
                };
                let url = format!("{}{}", base, self.path);

                let response = match client.request(method, &url).send().await {
                    Ok(r) => r,
                    Err(e) => return Ok(PollState::Pending(format!("{}: {}", url, e))),
                };
                let code = response.status().as_u16();
                if !self.expected_status.contains(&code) {
                    return Ok(PollState::Pending(format!("{} answered {}", url, code)));
                }
                let Some(pattern) = &self.body_pattern else {
                    return Ok(PollState::Ready);
                };
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        return Ok(PollState::Pending(format!(
                            "{} answered {} but the body could not be read: {}",
                            url, code, e
                        )))
                    }
                };
                if pattern.is_match(&body) {
                    Ok(PollState::Ready)
                } else {
                    Ok(PollState::Pending(format!(
                        "{} answered {} without /{}/",
                        url,
                        code,
                        pattern.as_str()
                    )))
                }
            }
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every request with `status` and `body`
    async fn serve(status: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn target(port: u16) -> FakeTarget {
        let mut target = FakeTarget::with_statuses(vec![]);
        target.address = Some(HostAndPort::localhost(port));
        target
    }

    #[test]
    fn path_gets_leading_slash() {
        assert_eq!(HttpWait::new("health").path, "/health");
        assert_eq!(HttpWait::new("/ready").path, "/ready");
    }

    #[tokio::test]
    async fn accepts_default_success_codes() {
        let port = serve("204 No Content", "").await;
        let strategy = WaitStrategy::http("/health").with_timeout(Duration::from_secs(2));
        assert!(strategy.wait_until_ready(&target(port)).await.is_ok());
    }

    #[tokio::test]
    async fn unexpected_status_times_out() {
        let port = serve("503 Service Unavailable", "starting").await;
        let strategy = WaitStrategy::http("/health")
            .with_timeout(Duration::from_millis(100))
            .with_poll_interval(Duration::from_millis(20));
        let err = strategy.wait_until_ready(&target(port)).await.unwrap_err();
        assert!(err.last_state.ends_with("answered 503"), "{}", err.last_state);
    }

    #[tokio::test]
    async fn body_pattern_must_match() {
        let port = serve("200 OK", "{\"status\":\"UP\"}").await;
        let wait = HttpWait::new("/actuator/health")
            .with_body_matching("\"status\":\\s*\"UP\"")
            .unwrap();
        let strategy = WaitStrategy::Http(wait).with_timeout(Duration::from_secs(2));
        assert!(strategy.wait_until_ready(&target(port)).await.is_ok());
    }

    #[test]
    fn methods_are_validated_up_front() {
        let head = HttpWait::new("/").with_method("head").unwrap();
        assert_eq!(head.method, Method::HEAD);
        assert_eq!(WaitStrategy::Http(head).describe(), "http HEAD /");

        let err = HttpWait::new("/").with_method("GE T").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("GE T"));
    }

    #[tokio::test]
    async fn truncated_body_is_reported_not_swallowed() {
        // Promises ten bytes, sends four, then closes
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\n{\"st")
                    .await;
            }
        });

        let wait = HttpWait::new("/health").with_body_matching("UP").unwrap();
        let strategy = WaitStrategy::Http(wait)
            .with_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(20));
        let err = strategy.wait_until_ready(&target(port)).await.unwrap_err();
        assert!(
            err.last_state.contains("body could not be read"),
            "{}",
            err.last_state
        );
    }

    #[test]
    fn invalid_body_pattern_is_rejected() {
        assert!(HttpWait::new("/").with_body_matching("(unclosed").is_err());
    }
}
