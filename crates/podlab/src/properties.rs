//! Connection properties published by started pods
//!
//! A pod named `db` publishes:
//!
//! | key                | value                                  |
//! |--------------------|----------------------------------------|
//! | `db.internal.host` | `db.<namespace>.svc.cluster.local`     |
//! | `db.internal.port` | primary port                           |
//! | `db.internal.url`  | `http://<internal host>:<port>`        |
//! | `db.external.host` | client-reachable host                  |
//! | `db.external.port` | client-reachable port                  |
//! | `db.external.url`  | `http://<external host>:<port>`        |
//! | `db.url`           | same as `db.external.url`              |

use std::collections::BTreeMap;

use crate::host::HostAndPort;
use podlab_common::{Error, Result};

/// Published key/value pairs, shared by every pod of a test
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertyContext {
    values: BTreeMap<String, String>,
}

impl PropertyContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing any earlier value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value of `key`, or a not-found error naming it
    pub fn resolve(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::not_found("property", key))
    }

    /// Replace every `${key}` in `template` with its value.
    ///
    /// Unknown keys are an error; text without placeholders is returned
    /// unchanged.
    pub fn interpolate(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(Error::validation(format!(
                    "unterminated placeholder in '{}'",
                    template
                )));
            };
            out.push_str(self.resolve(&after[..end])?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// All entries, sorted by key
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing has been published
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn publish_endpoint(&mut self, pod: &str, scope: &str, address: &HostAndPort) {
        self.set(format!("{pod}.{scope}.host"), address.host());
        self.set(format!("{pod}.{scope}.port"), address.port().to_string());
        self.set(format!("{pod}.{scope}.url"), address.http_url());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published() -> PropertyContext {
        let mut ctx = PropertyContext::new();
        ctx.publish_endpoint(
            "db",
            "internal",
            &HostAndPort::new("db.it-orders.svc.cluster.local", 5432),
        );
        ctx.publish_endpoint("db", "external", &HostAndPort::localhost(40123));
        ctx
    }

    #[test]
    fn endpoint_keys_follow_the_naming_convention() {
        let ctx = published();
        assert_eq!(ctx.get("db.internal.port"), Some("5432"));
        assert_eq!(ctx.get("db.external.host"), Some("127.0.0.1"));
        assert_eq!(ctx.get("db.external.url"), Some("http://127.0.0.1:40123"));
        assert_eq!(ctx.len(), 6);
    }

    #[test]
    fn interpolation_substitutes_known_keys() {
        let ctx = published();
        assert_eq!(
            ctx.interpolate("postgres://${db.external.host}:${db.external.port}/orders")
                .unwrap(),
            "postgres://127.0.0.1:40123/orders"
        );
        assert_eq!(ctx.interpolate("no placeholders").unwrap(), "no placeholders");
    }

    #[test]
    fn unknown_keys_are_errors() {
        let ctx = published();
        assert!(ctx.resolve("cache.url").unwrap_err().is_not_found());
        assert!(ctx.interpolate("${cache.url}/x").is_err());
        assert!(ctx.interpolate("${db.url").is_err());
    }
}
