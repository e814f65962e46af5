//! A namespace that is created on first use and deleted only by the
//! handle that created it

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cluster::Cluster;
use podlab_common::{Error, Result, LABEL_MANAGED_BY, LABEL_MANAGED_BY_PODLAB};

/// Namespace handle shared by every pod that runs in it
///
/// `create()` is idempotent per handle. `close()` deletes the namespace
/// only if this handle's create call made it; a namespace that already
/// existed, or that a concurrent creator won, is left alone.
pub struct TestNamespace {
    name: String,
    cluster: Cluster,
    created: AtomicBool,
    owned: AtomicBool,
    lock: Mutex<()>,
}

impl TestNamespace {
    /// Handle for `name` on `cluster`; nothing is created yet
    pub fn new(name: impl Into<String>, cluster: Cluster) -> Self {
        Self {
            name: name.into(),
            cluster,
            created: AtomicBool::new(false),
            owned: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// Namespace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster the namespace lives in
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Whether `create()` has completed on this handle
    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    /// Whether this handle's create call made the namespace
    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::SeqCst)
    }

    /// Ensure the namespace exists.
    ///
    /// A namespace created concurrently by someone else between the
    /// existence check and the create call counts as success. Other API
    /// errors are returned as-is.
    pub async fn create(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.created.load(Ordering::SeqCst) {
            return Ok(());
        }

        let client = self.cluster.client();
        if client.namespace_exists(&self.name).await? {
            debug!(namespace = %self.name, "namespace already exists");
        } else {
            let labels = BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_PODLAB.to_string(),
            )]);
            match client.create_namespace(&self.name, &labels).await {
                Ok(()) => {
                    info!(namespace = %self.name, cluster = %self.cluster.name(), "namespace created");
                    self.owned.store(true, Ordering::SeqCst);
                }
                Err(e) if e.is_already_exists() => {
                    debug!(namespace = %self.name, "namespace created concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Delete the namespace if this handle created it; no-op otherwise.
    ///
    /// Deleting a namespace removes everything inside it. When the delete
    /// call fails the handle still owns the namespace, so a later `close()`
    /// tries again.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !self.created.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.owned.load(Ordering::SeqCst) {
            debug!(namespace = %self.name, "leaving namespace this handle did not create");
            self.created.store(false, Ordering::SeqCst);
            return Ok(());
        }

        match self.cluster.client().delete_namespace(&self.name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(namespace = %self.name, "namespace already gone");
            }
            Err(e) => return Err(e),
        }
        self.owned.store(false, Ordering::SeqCst);
        self.created.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for TestNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestNamespace")
            .field("name", &self.name)
            .field("cluster", &self.cluster.name())
            .field("created", &self.is_created())
            .field("owned", &self.is_owned())
            .finish()
    }
}

/// Check that `name` can be used as a namespace
pub fn validate_name(name: &str) -> Result<()> {
    if crate::naming::is_dns_label(name) {
        Ok(())
    } else {
        Err(Error::validation_for_field(
            "namespace",
            format!("'{}' is not a valid namespace name", name),
        ))
    }
}
