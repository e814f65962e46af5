//! Host and port of a reachable endpoint

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use podlab_common::Error;

/// Loopback address used for locally forwarded ports
pub const LOOPBACK: &str = "127.0.0.1";

/// A host and port pair, IPv6-aware when rendered
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    /// Build from parts; brackets around IPv6 literals are stripped
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// Loopback endpoint on `port`
    pub fn localhost(port: u16) -> Self {
        Self::new(LOOPBACK, port)
    }

    /// Parse `host:port`, splitting at the last colon (`[::1]:8080` works)
    pub fn parse(value: &str) -> Result<Self, Error> {
        let (host, port) = value.rsplit_once(':').ok_or_else(|| {
            Error::validation(format!("'{}' is not in host:port form", value))
        })?;
        if host.is_empty() {
            return Err(Error::validation(format!("'{}' has an empty host", value)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::validation(format!("'{}' has an invalid port", value)))?;
        Ok(Self::new(host, port))
    }

    /// Host without brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `http://host:port`
    pub fn http_url(&self) -> String {
        format!("http://{}", self)
    }

    /// `https://host:port`
    pub fn https_url(&self) -> String {
        format!("https://{}", self)
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostAndPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_ipv6_forms() {
        let hp = HostAndPort::parse("db.ns.svc.cluster.local:5432").unwrap();
        assert_eq!(hp.host(), "db.ns.svc.cluster.local");
        assert_eq!(hp.port(), 5432);

        let hp: HostAndPort = "[::1]:8080".parse().unwrap();
        assert_eq!(hp.host(), "::1");
        assert_eq!(hp.to_string(), "[::1]:8080");
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(HostAndPort::parse("localhost").is_err());
        assert!(HostAndPort::parse(":80").is_err());
        assert!(HostAndPort::parse("host:99999").is_err());
    }

    #[test]
    fn renders_urls() {
        let hp = HostAndPort::localhost(30080);
        assert_eq!(hp.http_url(), "http://127.0.0.1:30080");
        assert_eq!(HostAndPort::new("fe80::1", 443).https_url(), "https://[fe80::1]:443");
    }
}
