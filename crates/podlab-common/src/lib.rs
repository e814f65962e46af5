//! Shared plumbing for podlab: errors, kube client setup, polling, retry,
//! environment configuration and logging initialization.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key carrying the workload name; also the selector key
pub const LABEL_APP: &str = "app";

/// Label key marking objects created by podlab
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for the managed-by label
pub const LABEL_MANAGED_BY_PODLAB: &str = "podlab";

/// Maximum length of a DNS-1123 label (namespace and object names)
pub const MAX_DNS_LABEL_LEN: usize = 63;
